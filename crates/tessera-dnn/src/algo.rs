//! The strategy abstraction.
//!
//! An [`Operation`] names one operation kind and its two argument bundles.
//! An [`Algorithm`] is one way of computing that operation. Strategies are
//! built once per device handle and shared read-only afterwards.

use std::fmt;

use tessera_core::Workspace;

use crate::{Error, Result};

/// One operation kind, e.g. convolution backward-filter.
pub trait Operation: 'static {
    /// Name used in diagnostics.
    const NAME: &'static str;

    /// Shape-only arguments used for selection and sizing.
    type SizeArgs<'a>: fmt::Display;

    /// Buffer-bound arguments used for execution.
    type ExecArgs<'a>;

    /// Shape-only view of a buffer-bound bundle.
    fn size_args<'s, 'a: 's>(args: &'s Self::ExecArgs<'a>) -> &'s Self::SizeArgs<'a>;

    /// Workspace borrowed by a buffer-bound bundle.
    fn workspace(args: &Self::ExecArgs<'_>) -> Workspace;
}

/// One implementation strategy for the operation `O`.
pub trait Algorithm<O: Operation>: Send + Sync {
    /// Stable name, unique within the registry of `O`.
    fn name(&self) -> &str;

    /// Whether repeated runs on identical inputs give bit-identical results.
    fn is_reproducible(&self) -> bool;

    /// Whether this strategy can run `args`.
    ///
    /// Never fails: unsupported configurations and descriptor-binding
    /// failures are reported as `false`.
    fn is_available(&self, args: &O::SizeArgs<'_>) -> bool;

    /// Scratch bytes this strategy needs for `args`.
    ///
    /// Only meaningful after `is_available(args)` returned true; a failing
    /// size query is an error, not an unavailability signal.
    fn get_workspace_in_bytes(&self, args: &O::SizeArgs<'_>) -> Result<usize>;

    /// Enqueue the computation. Output is overwritten, never accumulated.
    fn exec(&self, args: &O::ExecArgs<'_>) -> Result<()>;

    /// Available and needs at most `limit` bytes.
    fn is_available_wk(&self, args: &O::SizeArgs<'_>, limit: usize) -> Result<bool> {
        if !self.is_available(args) {
            return Ok(false);
        }
        Ok(self.get_workspace_in_bytes(args)? <= limit)
    }

    /// Like [`Algorithm::is_available_wk`], additionally rejecting
    /// non-reproducible strategies when `reproducible` is set.
    fn is_available_reproducible(
        &self,
        args: &O::SizeArgs<'_>,
        reproducible: bool,
        limit: usize,
    ) -> Result<bool> {
        if reproducible && !self.is_reproducible() {
            return Ok(false);
        }
        self.is_available_wk(args, limit)
    }

    /// Reject a workspace smaller than this strategy needs for `args`.
    fn check_workspace(&self, args: &O::SizeArgs<'_>, workspace: &Workspace) -> Result<()> {
        let required = self.get_workspace_in_bytes(args)?;
        if workspace.size < required {
            return Err(Error::WorkspaceTooSmall {
                algo: self.name().to_string(),
                required,
                provided: workspace.size,
            });
        }
        Ok(())
    }
}
