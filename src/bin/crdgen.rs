//! CRD YAML Generator
//!
//! Prints the EventListener CRD manifest.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/eventlistener.yaml

use event_listener_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
