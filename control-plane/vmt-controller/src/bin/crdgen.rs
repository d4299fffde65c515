use kube::core::CustomResourceExt;
use vmt_models::{VirtualMachineTemplate, VirtualMachineTemplateVersion};

fn main() {
    for crd in [
        VirtualMachineTemplate::crd(),
        VirtualMachineTemplateVersion::crd(),
    ] {
        let yaml = serde_yaml::to_string(&crd).expect("serialize CRD to YAML");
        println!("---\n{}", yaml);
    }
}
