//! Concordance windows: walking `meta:index`-ordered siblings along primary
//! parent edges, crossing into the neighbouring block when the siblings run
//! out.

use crate::{Result, Store, Value};

fn sentinel(right: bool) -> i64 {
    if right {
        i64::MIN
    } else {
        i64::MAX
    }
}

/// The child of `parent` (of `child_type`) closest to `bound` on the given
/// side, by `meta:index`. Children without an index sort at the bound and are
/// never returned.
fn child_bound(
    store: &Store,
    parent: i64,
    child_type: &str,
    bound: i64,
    right: bool,
) -> Result<Option<i64>> {
    let children = store.get_units(child_type, Some(parent))?;
    if children.is_empty() {
        return Ok(None);
    }
    let index = match store.get_feature_opt(child_type, "meta:index")? {
        Some((fid, _)) => store.get_feature_values(&children, &[fid])?,
        None => Default::default(),
    };
    let index_of =
        |unit: i64| index.get(&unit).and_then(Value::as_int).unwrap_or(bound);
    let mut ordered = children;
    ordered.sort_by_key(|unit| index_of(*unit));
    if right {
        Ok(ordered.into_iter().find(|unit| index_of(*unit) > bound))
    } else {
        Ok(ordered.into_iter().rev().find(|unit| index_of(*unit) < bound))
    }
}

/// The outermost `child_type` descendant on the given side of `unit`,
/// continuing into the next block over when `unit` has no such children.
fn get_edge(store: &Store, unit: i64, child_type: &str, right: bool) -> Result<Option<i64>> {
    if let Some(found) = child_bound(store, unit, child_type, sentinel(right), right)? {
        return Ok(Some(found));
    }
    match get_next(store, unit, right)? {
        Some(neighbour) => get_edge(store, neighbour, child_type, right),
        None => Ok(None),
    }
}

/// The linear neighbour of `unit` among units of its own type: the adjacent
/// sibling when one exists, otherwise the edge child of the parent's own
/// neighbour.
pub fn get_next(store: &Store, unit: i64, right: bool) -> Result<Option<i64>> {
    let unittype = store.get_unit_type(unit)?;
    let index = match store.get_feature_opt(&unittype, "meta:index")? {
        Some((fid, _)) => store
            .get_feature_value(unit, fid)?
            .and_then(|v| v.as_int())
            .unwrap_or_else(|| sentinel(right)),
        None => sentinel(right),
    };
    let parent = match store.get_parent(unit)? {
        Some(parent) => parent,
        None => return Ok(None),
    };
    if let Some(sibling) = child_bound(store, parent, &unittype, index, right)? {
        return Ok(Some(sibling));
    }
    match get_next(store, parent, right)? {
        Some(neighbour) => get_edge(store, neighbour, &unittype, right),
        None => Ok(None),
    }
}

/// The window `[u-width, …, u, …, u+width]` around `unit`, with `None` where
/// the corpus runs out.
pub fn get_span(store: &Store, unit: i64, width: usize) -> Result<Vec<Option<i64>>> {
    let mut left = Vec::with_capacity(width);
    let mut right = Vec::with_capacity(width);
    let (mut l, mut r) = (Some(unit), Some(unit));
    for _ in 0..width {
        l = match l {
            Some(u) => get_next(store, u, false)?,
            None => None,
        };
        r = match r {
            Some(u) => get_next(store, u, true)?,
            None => None,
        };
        left.push(l);
        right.push(r);
    }
    left.reverse();
    left.push(Some(unit));
    left.extend(right);
    Ok(left)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::ValueType;
    use crate::{create, StagingBuffer, Value};

    /// sentence > two phrases > three words each, indexed in order.
    fn fixture() -> (crate::Store, Vec<i64>) {
        let store = create(":memory:").unwrap();
        let mut buffer = StagingBuffer::new(&store, "tester");
        buffer.set_type("s", "sentence");
        buffer
            .set_feature("s", "meta:index", ValueType::Int, Value::Int(0).into(), None)
            .unwrap();
        for p in 0..2 {
            let pname = format!("p{}", p);
            buffer.set_type(&pname, "phrase");
            buffer.set_parent(&pname, "s");
            buffer
                .set_feature(&pname, "meta:index", ValueType::Int, Value::Int(p).into(), None)
                .unwrap();
            for w in 0..3 {
                let wname = format!("p{}w{}", p, w);
                buffer.set_type(&wname, "word");
                buffer.set_parent(&wname, &pname);
                buffer
                    .set_feature(
                        &wname,
                        "meta:index",
                        ValueType::Int,
                        Value::Int(w).into(),
                        None,
                    )
                    .unwrap();
            }
        }
        buffer.finish_block(None, false).unwrap();
        let mut words = Vec::new();
        for phrase in store.get_units("phrase", None).unwrap() {
            words.extend(store.get_units("word", Some(phrase)).unwrap());
        }
        (store, words)
    }

    #[test]
    fn next_crosses_phrase_boundaries() {
        let (store, words) = fixture();
        assert_eq!(get_next(&store, words[0], true).unwrap(), Some(words[1]));
        // Last word of the first phrase steps into the second phrase.
        assert_eq!(get_next(&store, words[2], true).unwrap(), Some(words[3]));
        assert_eq!(get_next(&store, words[3], false).unwrap(), Some(words[2]));
        assert_eq!(get_next(&store, words[0], false).unwrap(), None);
        assert_eq!(get_next(&store, words[5], true).unwrap(), None);
    }

    #[test]
    fn span_windows_are_centred_and_padded() {
        let (store, words) = fixture();
        assert_eq!(
            get_span(&store, words[2], 2).unwrap(),
            vec![
                Some(words[0]),
                Some(words[1]),
                Some(words[2]),
                Some(words[3]),
                Some(words[4]),
            ]
        );
        assert_eq!(
            get_span(&store, words[0], 2).unwrap(),
            vec![None, None, Some(words[0]), Some(words[1]), Some(words[2])]
        );
    }
}
