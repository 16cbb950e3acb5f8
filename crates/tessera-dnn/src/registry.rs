//! Ordered strategy lists.

use crate::algo::{Algorithm, Operation};

/// The fixed, ordered set of strategies for one operation kind.
///
/// Built-in strategies are registered first, vendor-enumerated ones after.
/// The order is the selection order. A registry is built once per device
/// handle and never mutated after the handle publishes it.
///
/// # Example
///
/// ```ignore
/// let mut registry = AlgorithmRegistry::new();
/// registry.register(AlgoChanwise).register(AlgoMatmul);
/// for algo in vendor_algos(version) {
///     registry.register(algo);
/// }
/// ```
pub struct AlgorithmRegistry<O: Operation> {
    algos: Vec<Box<dyn Algorithm<O>>>,
}

impl<O: Operation> AlgorithmRegistry<O> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self { algos: Vec::new() }
    }

    /// Append a strategy.
    ///
    /// Returns `self` for method chaining.
    pub fn register<A>(&mut self, algo: A) -> &mut Self
    where
        A: Algorithm<O> + 'static,
    {
        self.algos.push(Box::new(algo));
        self
    }

    /// All strategies in selection order.
    pub fn all(&self) -> impl Iterator<Item = &dyn Algorithm<O>> {
        self.algos.iter().map(|algo| algo.as_ref())
    }

    /// Look up a strategy by name.
    pub fn get(&self, name: &str) -> Option<&dyn Algorithm<O>> {
        self.all().find(|algo| algo.name() == name)
    }

    pub fn len(&self) -> usize {
        self.algos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.algos.is_empty()
    }

    /// Iterate over strategy names in selection order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.algos.iter().map(|algo| algo.name())
    }
}

impl<O: Operation> Default for AlgorithmRegistry<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use tessera_core::Workspace;

    use super::*;
    use crate::Result;

    struct MockOp;

    struct MockArgs;

    impl fmt::Display for MockArgs {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("mock")
        }
    }

    impl Operation for MockOp {
        const NAME: &'static str = "mock";
        type SizeArgs<'a> = MockArgs;
        type ExecArgs<'a> = (MockArgs, Workspace);

        fn size_args<'s, 'a: 's>(args: &'s Self::ExecArgs<'a>) -> &'s Self::SizeArgs<'a> {
            &args.0
        }

        fn workspace(args: &Self::ExecArgs<'_>) -> Workspace {
            args.1
        }
    }

    struct Named(&'static str);

    impl Algorithm<MockOp> for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn is_reproducible(&self) -> bool {
            true
        }
        fn is_available(&self, _args: &MockArgs) -> bool {
            true
        }
        fn get_workspace_in_bytes(&self, _args: &MockArgs) -> Result<usize> {
            Ok(0)
        }
        fn exec(&self, _args: &(MockArgs, Workspace)) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_keeps_order() {
        let mut registry = AlgorithmRegistry::<MockOp>::new();
        registry.register(Named("b")).register(Named("a"));
        registry.register(Named("c"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
        assert_eq!(registry.get("a").map(|a| a.name()), Some("a"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_empty_registry() {
        let registry = AlgorithmRegistry::<MockOp>::default();
        assert!(registry.is_empty());
        assert_eq!(registry.all().count(), 0);
    }
}
