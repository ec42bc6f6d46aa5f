pub mod interp;

pub use interp::HostExecutor;

use std::sync::Arc;

use parloop::exec::backend::BaselineExecutor;

/// A fresh baseline executor handle for guard construction.
pub fn executor() -> Arc<dyn BaselineExecutor> {
    Arc::new(HostExecutor::new())
}
