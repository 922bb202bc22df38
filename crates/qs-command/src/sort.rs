//! SORT with BY/GET/LIMIT/ALPHA/ASC/DESC/STORE over lists, sets and
//! sorted sets, including the `pattern*` key substitution and the
//! `key->field` hash lookups.

use std::cmp::Ordering;
use std::collections::VecDeque;

use qs_protocol::RespFrame;
use qs_store::Value;

use crate::{CommandError, Engine, Reply, parse_f64, parse_i64};

/// Sort key for one element. Elements whose BY lookup is missing or
/// non-numeric sort after everything else, ascending or descending.
enum SortKey {
    Num(f64),
    Bytes(Vec<u8>),
    Null,
}

fn compare(a: &SortKey, b: &SortKey, desc: bool) -> Ordering {
    let forward = match (a, b) {
        (SortKey::Null, SortKey::Null) => return Ordering::Equal,
        (SortKey::Null, _) => return Ordering::Greater,
        (_, SortKey::Null) => return Ordering::Less,
        (SortKey::Num(x), SortKey::Num(y)) => x.total_cmp(y),
        (SortKey::Bytes(x), SortKey::Bytes(y)) => x.cmp(y),
        (SortKey::Num(_), SortKey::Bytes(_)) => Ordering::Less,
        (SortKey::Bytes(_), SortKey::Num(_)) => Ordering::Greater,
    };
    if desc { forward.reverse() } else { forward }
}

pub(crate) fn sort_command(
    engine: &mut Engine,
    db_idx: usize,
    argv: &[Vec<u8>],
) -> Result<Reply, CommandError> {
    let (elements, is_zset) = match engine.dbs[db_idx].get(&argv[1]) {
        None => (Vec::new(), false),
        Some(Value::List(list)) => (list.iter().cloned().collect::<Vec<_>>(), false),
        Some(Value::Set(set)) => (set.iter().cloned().collect(), false),
        Some(Value::ZSet(zset)) => {
            (zset.iter().map(|(_, member)| member.to_vec()).collect(), true)
        }
        Some(_) => return Err(CommandError::WrongType),
    };

    let mut desc = false;
    let mut alpha = false;
    let mut range: Option<(usize, usize)> = None;
    let mut store: Option<Vec<u8>> = None;
    let mut by: Option<Vec<u8>> = None;
    let mut dontsort = false;
    let mut gets: Vec<Vec<u8>> = Vec::new();

    let mut j = 2;
    while j < argv.len() {
        let option = argv[j].to_ascii_lowercase();
        let remaining = argv.len() - j - 1;
        match option.as_slice() {
            b"asc" => desc = false,
            b"desc" => desc = true,
            b"alpha" => alpha = true,
            b"limit" if remaining >= 2 => {
                let start = parse_i64(&argv[j + 1])
                    .map(|raw| raw.max(0) as usize)
                    .ok_or(CommandError::Syntax)?;
                let count = parse_i64(&argv[j + 2]).ok_or(CommandError::Syntax)?;
                let end = if count <= 0 {
                    elements.len()
                } else {
                    start + count as usize
                };
                range = Some((start, end));
                j += 2;
            }
            b"store" if remaining >= 1 => {
                store = Some(argv[j + 1].clone());
                j += 1;
            }
            b"by" if remaining >= 1 => {
                by = Some(argv[j + 1].clone());
                if !argv[j + 1].contains(&b'*') {
                    dontsort = true;
                }
                j += 1;
            }
            b"get" if remaining >= 1 => {
                gets.push(argv[j + 1].clone());
                j += 1;
            }
            _ => return Err(CommandError::Syntax),
        }
        j += 1;
    }

    // Sorted sets are already ordered; a constant BY pattern falls
    // back to member order.
    if is_zset && dontsort {
        dontsort = false;
        alpha = true;
        by = None;
    }

    let mut vector: Vec<Vec<u8>> = if dontsort {
        elements
    } else {
        let mut keyed: Vec<(Vec<u8>, SortKey)> = Vec::with_capacity(elements.len());
        for element in elements {
            let by_value = match &by {
                Some(pattern) => lookup(engine, db_idx, pattern, &element),
                None => Some(element.clone()),
            };
            let key = match by_value {
                None => SortKey::Null,
                Some(bytes) if alpha => SortKey::Bytes(bytes),
                Some(bytes) => match parse_f64(&bytes) {
                    Some(number) => SortKey::Num(number),
                    None => SortKey::Null,
                },
            };
            keyed.push((element, key));
        }
        keyed.sort_by(|a, b| compare(&a.1, &b.1, desc));
        keyed.into_iter().map(|(element, _)| element).collect()
    };
    if let Some((start, end)) = range {
        let start = start.min(vector.len());
        let end = end.min(vector.len());
        vector = vector[start..end].to_vec();
    }

    match store {
        None => {
            let frames = if gets.is_empty() {
                vector.into_iter().map(RespFrame::bulk).collect()
            } else {
                let mut frames = Vec::with_capacity(vector.len() * gets.len());
                for element in &vector {
                    for pattern in &gets {
                        match lookup(engine, db_idx, pattern, element) {
                            Some(bytes) => frames.push(RespFrame::bulk(bytes)),
                            None => frames.push(RespFrame::null()),
                        }
                    }
                }
                frames
            };
            Reply::frame(RespFrame::array(frames))
        }
        Some(store_key) => {
            let values: VecDeque<Vec<u8>> = if gets.is_empty() {
                vector.into()
            } else {
                let mut values = VecDeque::with_capacity(vector.len() * gets.len());
                for element in &vector {
                    for pattern in &gets {
                        values.push_back(
                            lookup(engine, db_idx, pattern, element).unwrap_or_default(),
                        );
                    }
                }
                values
            };
            if engine.remove_key(db_idx, &store_key).is_some() {
                engine.signal(Some(&store_key), 0);
            }
            let stored = values.len();
            if stored > 0 {
                engine.dbs[db_idx].insert_data(store_key.clone(), Value::List(values));
                engine.signal(Some(&store_key), stored as u64);
            }
            Reply::int(stored as i64)
        }
    }
}

/// Resolve a BY/GET pattern for one element: `#` is the element
/// itself, `*` is substituted, and `key->field` reaches into a hash.
fn lookup(
    engine: &mut Engine,
    db_idx: usize,
    pattern: &[u8],
    element: &[u8],
) -> Option<Vec<u8>> {
    if pattern == b"#" {
        return Some(element.to_vec());
    }
    let key = substitute(pattern, element);
    match split_arrow(&key) {
        None => match engine.dbs[db_idx].get(&key) {
            Some(Value::Str(bytes)) => Some(bytes.clone()),
            _ => None,
        },
        Some((hash_key, field)) => match engine.dbs[db_idx].get(hash_key) {
            Some(Value::Hash(map)) => map.get(field).cloned(),
            _ => None,
        },
    }
}

fn substitute(pattern: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pattern.len() + replacement.len());
    for byte in pattern {
        if *byte == b'*' {
            out.extend_from_slice(replacement);
        } else {
            out.push(*byte);
        }
    }
    out
}

fn split_arrow(key: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = key.windows(2).position(|window| window == b"->")?;
    Some((&key[..pos], &key[pos + 2..]))
}
