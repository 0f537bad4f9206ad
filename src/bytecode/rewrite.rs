use crate::bytecode::op::Op;
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tracing::debug;

/// Rewrite dynamically-scoped name ops so the stream can run as a function.
///
/// Every `StoreName` becomes `StoreFast`. Every `LoadName` becomes
/// `LoadFast` when the name is one of `available` or has a local store, and
/// `LoadGlobal` otherwise. Every `DeleteName` becomes `DeleteFast` when the
/// name has a local store, and `DeleteGlobal` otherwise.
///
/// Returns the names that must be supplied as call arguments: every
/// available name loaded before any store to it, once each, in order of
/// first load.
pub fn rewrite_to_fast_locals<S>(ops: &mut [Op], available: &HashSet<S>) -> Vec<String>
where
    S: Borrow<str> + Hash + Eq,
{
    // name -> index of its first store
    let mut stored: HashMap<String, usize> = HashMap::new();
    for (idx, op) in ops.iter_mut().enumerate() {
        if let Op::StoreName(name) = op {
            let name = std::mem::take(name);
            stored.entry(name.clone()).or_insert(idx);
            *op = Op::StoreFast(name);
        }
    }

    let mut arg_names = Vec::new();
    let mut globals = 0usize;
    for (idx, op) in ops.iter_mut().enumerate() {
        match op {
            Op::LoadName(name) => {
                let name = std::mem::take(name);
                *op = if available.contains(name.as_str()) {
                    let stored_before = stored.get(&name).is_some_and(|&at| at < idx);
                    if !stored_before && !arg_names.contains(&name) {
                        arg_names.push(name.clone());
                    }
                    Op::LoadFast(name)
                } else if stored.contains_key(&name) {
                    Op::LoadFast(name)
                } else {
                    globals += 1;
                    Op::LoadGlobal(name)
                };
            }
            Op::DeleteName(name) => {
                let name = std::mem::take(name);
                *op = if stored.contains_key(&name) {
                    Op::DeleteFast(name)
                } else {
                    Op::DeleteGlobal(name)
                };
            }
            _ => {}
        }
    }

    debug!(
        locals = stored.len(),
        globals,
        args = ?arg_names,
        "rewrote dynamic names to fast locals"
    );

    arg_names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Const;

    fn names(list: &[&'static str]) -> HashSet<&'static str> {
        list.iter().copied().collect()
    }

    fn load(name: &str) -> Op {
        Op::LoadName(name.to_string())
    }

    fn store(name: &str) -> Op {
        Op::StoreName(name.to_string())
    }

    #[test]
    fn test_parameter_loaded_before_store_is_required() {
        let mut ops = vec![load("x"), store("y"), load("y"), Op::PopTop];
        let args = rewrite_to_fast_locals(&mut ops, &names(&["x"]));

        assert_eq!(args, vec!["x".to_string()]);
        assert_eq!(
            ops,
            vec![
                Op::LoadFast("x".to_string()),
                Op::StoreFast("y".to_string()),
                Op::LoadFast("y".to_string()),
                Op::PopTop,
            ]
        );
    }

    #[test]
    fn test_stored_before_load_is_never_required() {
        let mut ops = vec![
            Op::LoadConst(Const::Integer(1)),
            store("x"),
            load("x"),
            Op::PopTop,
        ];
        let args = rewrite_to_fast_locals(&mut ops, &names(&["x"]));

        assert!(args.is_empty());
        assert_eq!(ops[2], Op::LoadFast("x".to_string()));
    }

    #[test]
    fn test_unknown_names_become_globals() {
        let mut ops = vec![load("len"), Op::PopTop];
        let args = rewrite_to_fast_locals(&mut ops, &names(&["x"]));

        assert!(args.is_empty());
        assert_eq!(ops[0], Op::LoadGlobal("len".to_string()));
    }

    #[test]
    fn test_delete_ignores_parameters() {
        let mut ops = vec![
            Op::DeleteName("x".to_string()),
            Op::LoadConst(Const::None),
            store("tmp"),
            Op::DeleteName("tmp".to_string()),
        ];
        rewrite_to_fast_locals(&mut ops, &names(&["x"]));

        assert_eq!(ops[0], Op::DeleteGlobal("x".to_string()));
        assert_eq!(ops[3], Op::DeleteFast("tmp".to_string()));
    }

    #[test]
    fn test_repeated_loads_report_one_argument() {
        let mut ops = vec![load("b"), load("a"), load("b"), load("a"), Op::BuildTuple(4)];
        let args = rewrite_to_fast_locals(&mut ops, &names(&["a", "b"]));

        assert_eq!(args, vec!["b", "a"]);
        assert_eq!(ops[2], Op::LoadFast("b".to_string()));
    }

    #[test]
    fn test_second_pass_is_noop() {
        let mut ops = vec![load("x"), store("y"), load("z"), Op::DeleteName("y".into())];
        rewrite_to_fast_locals(&mut ops, &names(&["x"]));
        let once = ops.clone();

        let args = rewrite_to_fast_locals(&mut ops, &names(&["x"]));

        assert!(args.is_empty());
        assert_eq!(ops, once);
        assert!(!ops.iter().any(Op::is_dynamic_name));
    }

    #[test]
    fn test_accepts_owned_name_sets() {
        let available: HashSet<String> = ["x".to_string()].into_iter().collect();
        let mut ops = vec![load("x")];
        assert_eq!(rewrite_to_fast_locals(&mut ops, &available), vec!["x"]);
    }
}
