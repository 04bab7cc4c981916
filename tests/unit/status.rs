//! Unit tests for status computation

use postgres_ha_operator::controller::status::{
    compute_status, failed_status, is_stable, spec_changed,
};
use postgres_ha_operator::controller::{ClusterContext, ResourcesState, TopologyOutcome};
use postgres_ha_operator::crd::{
    BlockingOperation, BlockingOperationKind, ClusterPhase, Condition, PostgresClusterStatus,
    TopologyState,
};
use postgres_ha_operator::resources::InstanceRole;
use postgres_ha_operator::PostgresCluster;

use crate::common::*;

fn outcome(state: TopologyState) -> TopologyOutcome {
    TopologyOutcome {
        state,
        applied: Vec::new(),
        warnings: Vec::new(),
        blocking_operation: None,
        primary_unavailable_since: None,
    }
}

fn status_for(
    cluster: &PostgresCluster,
    state: &ResourcesState,
    topology: &TopologyOutcome,
) -> PostgresClusterStatus {
    let ctx = ClusterContext::new(cluster).unwrap();
    compute_status(&ctx, state, topology)
}

fn condition<'a>(status: &'a PostgresClusterStatus, type_: &str) -> &'a Condition {
    status
        .conditions
        .iter()
        .find(|c| c.type_ == type_)
        .unwrap_or_else(|| panic!("no {type_} condition"))
}

fn healthy_ha(cluster: &PostgresCluster) -> ResourcesState {
    state_with(vec![
        deployed_instance(cluster, 1, InstanceRole::Primary, true),
        deployed_instance(cluster, 2, InstanceRole::Replica, true),
        deployed_instance(cluster, 3, InstanceRole::Replica, true),
    ])
}

mod phase_tests {
    use super::*;

    #[test]
    fn test_all_ready_is_running() {
        let cluster = PostgresClusterBuilder::ha("db", "default").build();
        let status = status_for(&cluster, &healthy_ha(&cluster), &outcome(TopologyState::Stable));

        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.current_primary.as_deref(), Some("db-1"));
        assert_eq!(status.ready_primary_count, 1);
        assert_eq!(status.ready_replica_count, 2);
        assert_eq!(status.instances, 3);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(condition(&status, "Ready").status, "True");
        assert_eq!(condition(&status, "ConfigurationValid").status, "True");
        assert!(is_stable(&status));
    }

    #[test]
    fn test_no_instances_is_creating() {
        let cluster = create_test_cluster("db", "default", 1);
        let status = status_for(
            &cluster,
            &ResourcesState::default(),
            &outcome(TopologyState::NoInstances),
        );
        assert_eq!(status.phase, ClusterPhase::Creating);
        assert_eq!(condition(&status, "Progressing").status, "True");
        assert!(!is_stable(&status));
    }

    #[test]
    fn test_missing_replicas_is_scaling_once_created() {
        let mut cluster = PostgresClusterBuilder::ha("db", "default").build();
        cluster.status = Some(PostgresClusterStatus {
            phase: ClusterPhase::Running,
            ..Default::default()
        });
        let state = state_with(vec![deployed_instance(&cluster, 1, InstanceRole::Primary, true)]);
        let status = status_for(&cluster, &state, &outcome(TopologyState::ConvergingUp));
        assert_eq!(status.phase, ClusterPhase::Scaling);
    }

    #[test]
    fn test_unready_replica_is_degraded() {
        let mut cluster = PostgresClusterBuilder::ha("db", "default").build();
        cluster.status = Some(PostgresClusterStatus {
            phase: ClusterPhase::Running,
            ..Default::default()
        });
        let state = state_with(vec![
            deployed_instance(&cluster, 1, InstanceRole::Primary, true),
            deployed_instance(&cluster, 2, InstanceRole::Replica, true),
            deployed_instance(&cluster, 3, InstanceRole::Replica, false),
        ]);
        let status = status_for(&cluster, &state, &outcome(TopologyState::ConvergingUp));

        assert_eq!(status.phase, ClusterPhase::Degraded);
        assert_eq!(status.ready_replica_count, 1);
        assert_eq!(condition(&status, "Degraded").status, "True");
    }

    #[test]
    fn test_blocking_operation_is_failing_over() {
        let cluster = PostgresClusterBuilder::ha("db", "default").build();
        let mut topology = outcome(TopologyState::FailoverInProgress);
        topology.blocking_operation = Some(BlockingOperation {
            kind: BlockingOperationKind::Failover,
            target_instance: "db-2".to_string(),
            previous_primary: Some("db-1".to_string()),
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
        });
        let status = status_for(&cluster, &healthy_ha(&cluster), &topology);

        assert_eq!(status.phase, ClusterPhase::FailingOver);
        assert_eq!(
            status.blocking_operation.as_ref().unwrap().target_instance,
            "db-2"
        );
    }

    #[test]
    fn test_standby_has_no_current_primary() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_replicas(2)
            .with_standby("ext-pg")
            .build();
        let state = state_with(vec![
            deployed_instance(&cluster, 1, InstanceRole::StandbyReplica, true),
            deployed_instance(&cluster, 2, InstanceRole::Replica, true),
        ]);
        let status = status_for(&cluster, &state, &outcome(TopologyState::Stable));

        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.current_primary, None);
        assert_eq!(status.ready_primary_count, 0);
        assert_eq!(status.ready_replica_count, 2);
    }

    #[test]
    fn test_lost_primary_is_remembered() {
        let mut cluster = PostgresClusterBuilder::ha("db", "default").build();
        cluster.status = Some(PostgresClusterStatus {
            phase: ClusterPhase::Running,
            current_primary: Some("db-1".to_string()),
            ..Default::default()
        });
        let state = state_with(vec![deployed_instance(&cluster, 2, InstanceRole::Replica, true)]);
        let status = status_for(&cluster, &state, &outcome(TopologyState::ConvergingUp));
        assert_eq!(status.current_primary.as_deref(), Some("db-1"));
    }
}

mod failed_status_tests {
    use super::*;

    #[test]
    fn test_failed_status_keeps_counts() {
        let mut cluster = PostgresClusterBuilder::ha("db", "default")
            .with_generation(4)
            .build();
        cluster.status = Some(PostgresClusterStatus {
            phase: ClusterPhase::Running,
            ready_primary_count: 1,
            ready_replica_count: 2,
            instances: 3,
            current_primary: Some("db-1".to_string()),
            observed_generation: Some(3),
            ..Default::default()
        });
        let ctx = ClusterContext::new(&cluster).unwrap();
        let status = failed_status(&ctx, "InvalidSpec", "image must be set");

        assert_eq!(status.phase, ClusterPhase::Failed);
        assert_eq!(status.instances, 3);
        assert_eq!(status.current_primary.as_deref(), Some("db-1"));
        assert_eq!(status.observed_generation, Some(4));
        let valid = condition(&status, "ConfigurationValid");
        assert_eq!(valid.status, "False");
        assert_eq!(valid.reason, "InvalidSpec");
        assert_eq!(valid.message, "image must be set");
    }
}

mod spec_changed_tests {
    use super::*;

    #[test]
    fn test_never_observed_has_changed() {
        let cluster = create_test_cluster("db", "default", 1);
        assert!(spec_changed(&cluster));
    }

    #[test]
    fn test_observed_generation_matches() {
        let mut cluster = PostgresClusterBuilder::new("db", "default")
            .with_generation(2)
            .build();
        cluster.status = Some(PostgresClusterStatus {
            observed_generation: Some(2),
            ..Default::default()
        });
        assert!(!spec_changed(&cluster));

        cluster.metadata.generation = Some(3);
        assert!(spec_changed(&cluster));
    }
}
