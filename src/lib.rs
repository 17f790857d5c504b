//! DXIL-T: instrumentation-oriented IR framework for DXIL shaders.
//!
//! DXIL modules ([`dxil::DxilModule`]) are LLVM 3.7 bitcode (usually inside
//! a DXBC container), and only the parts instrumentation needs are lifted
//! into the IL ([`il::Program`]): types, constants, resources, and function
//! bodies. Everything else is carried along as records, and re-emitted
//! (with value ids remapped) when the module is compiled back.
//!
//! On top of that, [`controller::InstrumentationController`] drives the
//! compilation of instrumented variants of shaders and pipelines, in the
//! background, as instrumentation requests come in.

// NOTE(eddyb) all the modules are declared here, but they're documented
// (where relevant) in their own files.
mod context;
pub use context::{Const, Context, InternedStr, Type};

pub mod compiler;
pub mod config;
pub mod controller;
pub mod dxbc;
pub mod dxil;
pub mod features;
pub mod il;
pub mod llvm;
pub mod message;
pub mod shader_data;
pub mod state;

pub mod passes {
    // NOTE(eddyb) inline `mod` to avoid adding APIs here, it's just namespacing.

    pub mod resource_bounds;
}

// HACK(eddyb) work around the lack of `FxIndex{Map,Set}` type aliases elsewhere.
#[doc(hidden)]
pub type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
#[doc(hidden)]
pub type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Run `f`, logging how long it took (at `debug` level).
pub fn timed_pass<R>(name: &str, f: impl FnOnce() -> R) -> R {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return f();
    }

    let start = std::time::Instant::now();
    let r = f();
    tracing::debug!(
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "{name}"
    );
    r
}
