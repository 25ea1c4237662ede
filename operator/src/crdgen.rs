use kube::CustomResourceExt;

use nodedaemon_operator::cluster::CephCluster;
use nodedaemon_operator::mirror::CephFilesystemMirror;

fn main() {
    print!("{}", serde_yaml::to_string(&CephCluster::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&CephFilesystemMirror::crd()).unwrap());
}
