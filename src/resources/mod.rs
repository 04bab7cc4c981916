pub mod backup;
pub mod base_config;
pub mod common;
pub mod instance;
pub mod service;

pub use common::{
    API_VERSION, FIELD_MANAGER, InstanceRole, KIND, instance_labels, owner_reference,
    standard_labels,
};
