use kube::CustomResourceExt;

use quarks_operator::deployment::BOSHDeployment;
use quarks_operator::quarks::{QuarksJob, QuarksSecret};

fn main() {
    print!("{}", serde_yaml::to_string(&BOSHDeployment::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&QuarksSecret::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&QuarksJob::crd()).unwrap());
}
