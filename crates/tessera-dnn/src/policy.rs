//! Strategy selection.

use std::env;

use tracing::{debug, warn};

use crate::algo::{Algorithm, Operation};
use crate::registry::AlgorithmRegistry;
use crate::{Error, Result};

/// Environment variable holding the default workspace limit, in bytes.
pub const WORKSPACE_LIMIT_ENV: &str = "TESSERA_WORKSPACE_LIMIT";

/// Environment variable requesting reproducible strategies (`1`/`true`/`yes`).
pub const REPRODUCIBLE_ENV: &str = "TESSERA_REPRODUCIBLE";

/// Constraints applied when picking a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionPolicy {
    /// Upper bound on the workspace a strategy may ask for.
    pub workspace_limit: usize,
    /// Prefer strategies with bit-identical results across runs.
    pub reproducible: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            workspace_limit: usize::MAX,
            reproducible: false,
        }
    }
}

impl ExecutionPolicy {
    pub fn with_workspace_limit(mut self, limit: usize) -> Self {
        self.workspace_limit = limit;
        self
    }

    /// This policy with its limit lowered to `limit` when that is tighter.
    pub fn capped_to(mut self, limit: usize) -> Self {
        self.workspace_limit = self.workspace_limit.min(limit);
        self
    }

    pub fn with_reproducible(mut self, reproducible: bool) -> Self {
        self.reproducible = reproducible;
        self
    }

    /// Defaults overridden by `TESSERA_WORKSPACE_LIMIT` and
    /// `TESSERA_REPRODUCIBLE` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut policy = Self::default();
        if let Some(raw) = lookup(WORKSPACE_LIMIT_ENV) {
            policy.workspace_limit = raw.trim().parse().map_err(|_| {
                Error::InvalidArgs(format!("{WORKSPACE_LIMIT_ENV}={raw:?} is not a byte count"))
            })?;
        }
        if let Some(raw) = lookup(REPRODUCIBLE_ENV) {
            policy.reproducible = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(Error::InvalidArgs(format!(
                        "{REPRODUCIBLE_ENV}={raw:?} is not a boolean"
                    )));
                }
            };
        }
        Ok(policy)
    }
}

/// First strategy in `registry` meeting the requirement and the limit.
///
/// With `reproducible` set, the result is always a reproducible strategy.
pub fn find_algorithm<'r, O: Operation>(
    registry: &'r AlgorithmRegistry<O>,
    args: &O::SizeArgs<'_>,
    reproducible: bool,
    limit: usize,
) -> Result<Option<&'r dyn Algorithm<O>>> {
    for algo in registry.all() {
        if algo.is_available_reproducible(args, reproducible, limit)? {
            return Ok(Some(algo));
        }
    }
    Ok(None)
}

/// Pick the strategy to run `args` with.
///
/// If no reproducible strategy fits, the requirement is dropped and the
/// list is searched again. Exhausting both passes is an error.
pub fn select_algorithm<'r, O: Operation>(
    registry: &'r AlgorithmRegistry<O>,
    args: &O::SizeArgs<'_>,
    policy: &ExecutionPolicy,
) -> Result<&'r dyn Algorithm<O>> {
    let limit = policy.workspace_limit;
    let mut found = find_algorithm(registry, args, policy.reproducible, limit)?;
    if found.is_none() && policy.reproducible {
        warn!(
            op = O::NAME,
            %args,
            limit,
            "no reproducible algorithm fits, falling back to non-reproducible ones"
        );
        found = find_algorithm(registry, args, false, limit)?;
    }
    let algo = found.ok_or_else(|| Error::NoUsableAlgorithm {
        op: O::NAME,
        args: args.to_string(),
        limit,
    })?;
    debug!(op = O::NAME, algo = algo.name(), limit, "selected algorithm");
    Ok(algo)
}

/// Run `algo` after checking the borrowed workspace is large enough.
///
/// Nothing is enqueued when the check fails.
pub fn exec_checked<O: Operation>(algo: &dyn Algorithm<O>, args: &O::ExecArgs<'_>) -> Result<()> {
    algo.check_workspace(O::size_args(args), &O::workspace(args))?;
    algo.exec(args)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fmt;

    use tessera_core::Workspace;

    use super::*;

    struct ToyOp;

    /// Problem size; each toy strategy needs `size * factor` bytes.
    struct ToyArgs(usize);

    impl fmt::Display for ToyArgs {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "size={}", self.0)
        }
    }

    impl Operation for ToyOp {
        const NAME: &'static str = "toy";
        type SizeArgs<'a> = ToyArgs;
        type ExecArgs<'a> = (ToyArgs, Workspace);

        fn size_args<'s, 'a: 's>(args: &'s Self::ExecArgs<'a>) -> &'s Self::SizeArgs<'a> {
            &args.0
        }

        fn workspace(args: &Self::ExecArgs<'_>) -> Workspace {
            args.1
        }
    }

    struct Toy {
        name: &'static str,
        reproducible: bool,
        factor: usize,
        max_size: usize,
    }

    impl Algorithm<ToyOp> for Toy {
        fn name(&self) -> &str {
            self.name
        }
        fn is_reproducible(&self) -> bool {
            self.reproducible
        }
        fn is_available(&self, args: &ToyArgs) -> bool {
            args.0 <= self.max_size
        }
        fn get_workspace_in_bytes(&self, args: &ToyArgs) -> Result<usize> {
            Ok(args.0 * self.factor)
        }
        fn exec(&self, _args: &(ToyArgs, Workspace)) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> AlgorithmRegistry<ToyOp> {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(Toy {
                name: "SLOW_REPRO",
                reproducible: true,
                factor: 8,
                max_size: usize::MAX,
            })
            .register(Toy {
                name: "FAST",
                reproducible: false,
                factor: 1,
                max_size: usize::MAX,
            })
            .register(Toy {
                name: "SMALL_ONLY",
                reproducible: true,
                factor: 0,
                max_size: 4,
            });
        registry
    }

    #[test]
    fn test_first_fitting_algorithm_wins() {
        let registry = registry();
        let policy = ExecutionPolicy::default();
        let algo = select_algorithm(&registry, &ToyArgs(10), &policy).unwrap();
        assert_eq!(algo.name(), "SLOW_REPRO");

        let policy = policy.with_workspace_limit(20);
        let algo = select_algorithm(&registry, &ToyArgs(10), &policy).unwrap();
        assert_eq!(algo.name(), "FAST");
    }

    #[test]
    fn test_reproducible_requirement_is_dropped_when_nothing_fits() {
        let registry = registry();
        let policy = ExecutionPolicy::default()
            .with_workspace_limit(20)
            .with_reproducible(true);

        assert!(
            find_algorithm(&registry, &ToyArgs(10), true, 20)
                .unwrap()
                .is_none()
        );
        let algo = select_algorithm(&registry, &ToyArgs(10), &policy).unwrap();
        assert_eq!(algo.name(), "FAST");

        let algo = select_algorithm(&registry, &ToyArgs(3), &policy).unwrap();
        assert_eq!(algo.name(), "SMALL_ONLY");
    }

    #[test]
    fn test_capped_to_only_lowers_the_limit() {
        let policy = ExecutionPolicy::default().with_workspace_limit(16);
        assert_eq!(policy.capped_to(64).workspace_limit, 16);
        assert_eq!(policy.capped_to(8).workspace_limit, 8);
        assert_eq!(ExecutionPolicy::default().capped_to(8).workspace_limit, 8);
    }

    #[test]
    fn test_no_usable_algorithm() {
        let registry = registry();
        let policy = ExecutionPolicy::default().with_workspace_limit(5);
        let Err(err) = select_algorithm(&registry, &ToyArgs(10), &policy) else {
            panic!("nothing fits in 5 bytes");
        };
        match err {
            Error::NoUsableAlgorithm { op, args, limit } => {
                assert_eq!(op, "toy");
                assert_eq!(args, "size=10");
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exec_checked_rejects_small_workspace() {
        let registry = registry();
        let algo = registry.get("SLOW_REPRO").unwrap();
        let args = (ToyArgs(4), Workspace::new(tessera_core::DevicePtr(0x100), 31));
        let err = exec_checked(algo, &args).unwrap_err();
        assert!(matches!(
            err,
            Error::WorkspaceTooSmall {
                required: 32,
                provided: 31,
                ..
            }
        ));
    }

    #[test]
    fn test_policy_from_lookup() {
        let vars: HashMap<&str, &str> =
            HashMap::from([(WORKSPACE_LIMIT_ENV, "4096"), (REPRODUCIBLE_ENV, "Yes")]);
        let policy = ExecutionPolicy::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(policy.workspace_limit, 4096);
        assert!(policy.reproducible);

        let policy = ExecutionPolicy::from_lookup(|_| None).unwrap();
        assert_eq!(policy, ExecutionPolicy::default());

        let err = ExecutionPolicy::from_lookup(|k| {
            (k == WORKSPACE_LIMIT_ENV).then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));

        let err =
            ExecutionPolicy::from_lookup(|k| (k == REPRODUCIBLE_ENV).then(|| "maybe".to_string()))
                .unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));
    }
}
