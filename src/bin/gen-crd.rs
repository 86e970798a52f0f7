use kube::CustomResourceExt;
use triton::crd::deployflow::DeployFlow;

fn main() -> anyhow::Result<()> {
    // Pipe through a JSON-to-YAML converter to get a manifest for kubectl apply
    let crd = serde_json::to_string_pretty(&DeployFlow::crd())?;
    println!("{}", crd);
    Ok(())
}
