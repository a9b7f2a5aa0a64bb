//! Round-robin function selection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::workers::FunctionRef;

/// Selects functions in round-robin order
///
/// Uses an atomic cursor so concurrent selections never share a position and
/// a given dispatch sequence always yields the same assignment.
pub struct FunctionSelector {
    functions: Vec<Arc<FunctionRef>>,
    index: AtomicUsize,
}

impl FunctionSelector {
    pub fn new(functions: Vec<FunctionRef>) -> Result<Self> {
        if functions.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "no remote functions configured".to_string(),
            ));
        }
        Ok(Self {
            functions: functions.into_iter().map(Arc::new).collect(),
            index: AtomicUsize::new(0),
        })
    }

    pub fn select(&self) -> Arc<FunctionRef> {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.functions.len();
        Arc::clone(&self.functions[idx])
    }

    /// Function bound to the `n`th persistent worker, cycling through the set
    pub fn function_at(&self, n: usize) -> Arc<FunctionRef> {
        Arc::clone(&self.functions[n % self.functions.len()])
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
