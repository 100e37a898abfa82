//! Prints the `TerraformStack` CRD manifest for cluster installation.

use kube::CustomResourceExt;
use terraform_stack_controller::crd::TerraformStack;

fn main() {
    match serde_yaml::to_string(&TerraformStack::crd()) {
        Ok(manifest) => print!("{manifest}"),
        Err(e) => {
            eprintln!("Failed to render CRD: {e}");
            std::process::exit(1);
        }
    }
}
