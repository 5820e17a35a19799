//! Start-order computation: Kahn's topological sort over the `order`
//! constraints, with declaration order as the stable tiebreaker. A cycle
//! is not fatal: the remaining nodes are appended in declaration order and
//! the cycle is logged.

use tracing::warn;

/// `(first, then)` pairs: `first` starts before `then`.
pub type OrderEdge = (String, String);

/// Compute the start order for `declared` (in declaration order) under the
/// given edges. Every declared resource appears exactly once; edges naming
/// undeclared resources are ignored (config validation rejects them
/// upstream).
pub fn start_order(declared: &[String], edges: &[OrderEdge]) -> Vec<String> {
    let index_of = |name: &str| declared.iter().position(|d| d == name);

    let mut indegree = vec![0usize; declared.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); declared.len()];
    for (first, then) in edges {
        let (Some(from), Some(to)) = (index_of(first), index_of(then)) else {
            continue;
        };
        successors[from].push(to);
        indegree[to] += 1;
    }

    let mut order = Vec::with_capacity(declared.len());
    let mut placed = vec![false; declared.len()];
    loop {
        // Smallest declaration index among ready nodes keeps the sort stable.
        let Some(next) = (0..declared.len()).find(|&i| !placed[i] && indegree[i] == 0) else {
            break;
        };
        placed[next] = true;
        order.push(declared[next].clone());
        for &to in &successors[next] {
            indegree[to] -= 1;
        }
    }

    if order.len() < declared.len() {
        let remaining: Vec<&String> = declared
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed[*i])
            .map(|(_, name)| name)
            .collect();
        warn!(?remaining, "order constraints form a cycle, appending in declaration order");
        order.extend(remaining.into_iter().cloned());
    }
    order
}

/// Stop order is the reverse of start order.
pub fn stop_order(declared: &[String], edges: &[OrderEdge]) -> Vec<String> {
    let mut order = start_order(declared, edges);
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn edges(list: &[(&str, &str)]) -> Vec<OrderEdge> {
        list.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn no_constraints_keeps_declaration_order() {
        let declared = names(&["a", "b", "c"]);
        assert_eq!(start_order(&declared, &[]), declared);
    }

    #[test]
    fn order_constraints_are_honoured() {
        let declared = names(&["vip", "web", "db"]);
        let order = start_order(&declared, &edges(&[("db", "web"), ("web", "vip")]));
        assert_eq!(order, names(&["db", "web", "vip"]));
    }

    #[test]
    fn stop_order_is_reversed() {
        let declared = names(&["vip", "web", "db"]);
        let order = stop_order(&declared, &edges(&[("db", "web"), ("web", "vip")]));
        assert_eq!(order, names(&["vip", "web", "db"]));
    }

    #[test]
    fn cycle_appends_remaining_in_declaration_order() {
        let declared = names(&["a", "b", "c", "d"]);
        let order = start_order(&declared, &edges(&[("b", "c"), ("c", "b")]));
        // `a` and `d` are unconstrained; the b/c cycle lands afterwards in
        // declaration order. Every resource appears exactly once.
        assert_eq!(order, names(&["a", "d", "b", "c"]));
        let mut sorted = order.clone();
        sorted.sort();
        let mut expected = declared.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn ties_break_by_declaration_order() {
        let declared = names(&["z", "a", "m"]);
        let order = start_order(&declared, &edges(&[("z", "m")]));
        assert_eq!(order, names(&["z", "a", "m"]));
    }
}
