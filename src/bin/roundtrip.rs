use dxilt::compiler::DxilShaderCompiler;
use dxilt::features::{FeatureHosts, FeatureRegistry};
use std::rc::Rc;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = std::env::args().collect::<Vec<_>>();
    let (in_file, out_file, features) = match &args[..] {
        [_, in_file, out_file] => (in_file, out_file, None),
        [_, in_file, out_file, flag, features] if flag == "--instrument" => {
            (in_file, out_file, Some(features))
        }
        _ => {
            eprintln!(
                "Usage: {} IN OUT [--instrument FEATURE,...|all]",
                args.first().map_or("roundtrip", |s| s.as_str())
            );
            std::process::exit(1);
        }
    };

    let in_bytes = std::fs::read(in_file)?;
    let out_bytes = match features {
        None => {
            let module = dxilt::timed_pass("DxilModule::parse", || {
                dxilt::dxil::DxilModule::parse(&in_bytes, Rc::new(dxilt::Context::new()))
            })?;
            eprintln!(
                "{} functions, {} instructions",
                module.program().functions.len(),
                module.program().instruction_count()
            );
            dxilt::timed_pass("DxilModule::compile", || module.compile())?
        }
        Some(features) => {
            let hosts = FeatureHosts::default();
            let registry = FeatureRegistry::with_builtin(&hosts);
            let mut bits = 0;
            for name in features.split(',').filter(|s| !s.is_empty()) {
                bits |= match name {
                    "all" => registry.all(),
                    _ => registry
                        .bit(name)
                        .ok_or_else(|| format!("unknown feature `{name}`"))?,
                };
            }
            let compiler =
                DxilShaderCompiler::new(Arc::new(registry), hosts, &dxilt::config::CONFIG);
            compiler.instrument(&in_bytes, bits)?
        }
    };

    eprintln!("{} -> {} bytes", in_bytes.len(), out_bytes.len());
    std::fs::write(out_file, out_bytes)?;
    Ok(())
}
