use serde::Serialize;

use manifold_core::Content;

/// Field-level change counts between two content trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Count what it takes to turn `base` into `target`. Keys only in `target`
/// are adds, keys only in `base` removes; arrays compare by position.
pub fn diff_summary(target: &Content, base: &Content) -> DiffSummary {
    let mut sum = DiffSummary::default();
    walk(target, base, &mut sum);
    sum
}

fn walk(a: &Content, b: &Content, sum: &mut DiffSummary) {
    use serde_json::Value as V;
    match (a, b) {
        (V::Object(ao), V::Object(bo)) => {
            for (k, av) in ao.iter() {
                match bo.get(k) {
                    Some(bv) if av == bv => {}
                    Some(bv) => walk(av, bv, sum),
                    None => sum.adds += 1,
                }
            }
            sum.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
        }
        (V::Array(aa), V::Array(bb)) => {
            sum.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
            sum.adds += aa.len().saturating_sub(bb.len());
            sum.removes += bb.len().saturating_sub(aa.len());
        }
        (av, bv) => {
            if av != bv { sum.updates += 1; }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_nested_changes() {
        let base = json!({ "data": { "a": "1", "b": "2" }, "items": [1, 2, 3] });
        let target = json!({ "data": { "a": "9", "c": "3" }, "items": [1, 5], "extra": true });
        let s = diff_summary(&target, &base);
        // data.c, extra
        assert_eq!(s.adds, 2);
        // data.a, items[1]
        assert_eq!(s.updates, 2);
        // data.b, items[2]
        assert_eq!(s.removes, 2);
    }

    #[test]
    fn identical_trees_are_empty() {
        let v = json!({ "kind": "Pod", "spec": { "x": [1] } });
        assert!(diff_summary(&v, &v).is_empty());
    }
}
