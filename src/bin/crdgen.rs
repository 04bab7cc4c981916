use kube::CustomResourceExt;
use postgres_ha_operator::crd::PostgresCluster;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&PostgresCluster::crd())?);
    Ok(())
}
