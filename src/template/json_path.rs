//! Dotted/indexed JSON path lookup
//!
//! Paths look like `data[0].url`, `candidates[0].content.parts` or, with a
//! wildcard, `data[*].url`. Used for `response_path`, `status_path` and
//! `task_id_path`.

use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PathSeg {
    Key(String),
    Index(usize),
    Wildcard,
}

/// Parse a dotted/array path like `a.b[0].c[*]` into segments
pub(crate) fn parse_path(path: &str) -> Vec<PathSeg> {
    let mut segs = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if !key.is_empty() {
            segs.push(PathSeg::Key(key.to_string()));
        }
        // Zero or more [n] / [*]
        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(end) = stripped.find(']') else {
                break;
            };
            let inner = stripped[..end].trim();
            if inner == "*" {
                segs.push(PathSeg::Wildcard);
            } else if let Ok(idx) = inner.parse::<usize>() {
                segs.push(PathSeg::Index(idx));
            }
            rest = &stripped[end + 1..];
        }
    }
    segs
}

/// Get a single value by path. A wildcard segment selects the first element.
pub fn get_path<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = v;
    for seg in parse_path(path) {
        cur = match (seg, cur) {
            (PathSeg::Key(k), Value::Object(map)) => map.get(&k)?,
            (PathSeg::Index(i), Value::Array(arr)) => arr.get(i)?,
            (PathSeg::Wildcard, Value::Array(arr)) => arr.first()?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Collect every value matching the path, expanding wildcards
pub fn get_all<'a>(v: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![v];
    for seg in parse_path(path) {
        let mut next = Vec::new();
        for value in current {
            match (&seg, value) {
                (PathSeg::Key(k), Value::Object(map)) => next.extend(map.get(k)),
                (PathSeg::Index(i), Value::Array(arr)) => next.extend(arr.get(*i)),
                (PathSeg::Wildcard, Value::Array(arr)) => next.extend(arr.iter()),
                _ => {}
            }
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

/// Render a scalar found at a path as a string (`"abc"` -> `abc`, `3` -> `3`)
pub fn get_string(v: &Value, path: &str) -> Option<String> {
    match get_path(v, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn parse_mixed_path() {
        let segs = parse_path("a.b[2].c[0][*]");
        assert_eq!(
            segs,
            vec![
                PathSeg::Key("a".into()),
                PathSeg::Key("b".into()),
                PathSeg::Index(2),
                PathSeg::Key("c".into()),
                PathSeg::Index(0),
                PathSeg::Wildcard,
            ]
        );
    }

    #[test]
    fn indexed_lookup() {
        let v = json!({"data": [{"url": "https://x/1.png"}]});
        assert_eq!(get_path(&v, "data[0].url"), Some(&json!("https://x/1.png")));
        assert_eq!(get_path(&v, "data[1].url"), None);
        assert_eq!(get_path(&v, "data.url"), None);
    }

    #[test]
    fn wildcard_collects_all_matches() {
        let v = json!({"data": {"data": {"data": [{"url": "a"}, {"url": "b"}, {"x": 1}]}}});
        let urls: Vec<&Value> = get_all(&v, "data.data.data[*].url");
        assert_eq!(urls, vec![&json!("a"), &json!("b")]);
        assert_eq!(get_path(&v, "data.data.data[*].url"), Some(&json!("a")));
    }

    #[test]
    fn scalar_rendering() {
        let v = json!({"task": {"id": 42, "status": "SUCCESS"}});
        assert_eq!(get_string(&v, "task.id").as_deref(), Some("42"));
        assert_eq!(get_string(&v, "task.status").as_deref(), Some("SUCCESS"));
        assert_eq!(get_string(&v, "task"), None);
    }

    proptest! {
        // Any index path into a long enough array resolves to that element
        #[test]
        fn prop_index_resolves(i in 0usize..16) {
            let arr: Vec<Value> = (0..16).map(|n| json!({"n": n})).collect();
            let v = json!({"items": arr});
            let got = get_path(&v, &format!("items[{i}].n")).and_then(|x| x.as_u64());
            prop_assert_eq!(got, Some(i as u64));
        }
    }
}
