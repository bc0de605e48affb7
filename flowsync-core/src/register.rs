//! Last-writer-wins registers stored inside yrs maps.
//!
//! A register named `field` is a family of entries `"{field}@{actor}"`, one
//! per actor that has written it, each holding a JSON-encoded [`Stamped`]
//! value. The visible value is the entry with the greatest `(ts, actor)`
//! pair. An actor only ever inserts under its own key, so yrs never has to
//! arbitrate between two writers of the same key; it may delete entries it
//! has observed because its own entry now dominates them. A concurrent
//! rewrite of a deleted entry is a different yrs item and survives.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::{Any, Map, MapRef, Out, ReadTxn, TransactionMut};

use crate::error::DocumentError;

/// Separator between field name and actor id in entry keys.
const SEPARATOR: char = '@';

/// One actor's write to a register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped {
    pub ts: u64,
    pub actor: String,
    pub value: Value,
}

impl Stamped {
    /// Total order used to pick the visible value. Ties on `ts` go to the
    /// lexicographically greater actor id.
    pub fn dominates(&self, other: &Stamped) -> bool {
        (self.ts, self.actor.as_str()) > (other.ts, other.actor.as_str())
    }
}

pub fn entry_key(field: &str, actor: &str) -> String {
    format!("{field}{SEPARATOR}{actor}")
}

/// Extract the string payload of a map value.
pub(crate) fn out_str(out: &Out) -> Option<&str> {
    match out {
        Out::Any(Any::String(s)) => Some(s.as_ref()),
        _ => None,
    }
}

fn parse_entry(key: &str, out: &Out) -> Option<(String, Stamped)> {
    let (field, _actor) = key.split_once(SEPARATOR)?;
    let raw = out_str(out)?;
    match serde_json::from_str::<Stamped>(raw) {
        Ok(stamped) => Some((field.to_string(), stamped)),
        Err(e) => {
            log::warn!("Ignoring unreadable register entry {key}: {e}");
            None
        }
    }
}

/// Winning entry of one register, if any actor has written it.
pub fn read_entry<T: ReadTxn>(map: &MapRef, txn: &T, field: &str) -> Option<Stamped> {
    let mut winner: Option<Stamped> = None;
    for (key, out) in map.iter(txn) {
        let Some((name, stamped)) = parse_entry(key, &out) else {
            continue;
        };
        if name != field {
            continue;
        }
        if winner.as_ref().map_or(true, |w| stamped.dominates(w)) {
            winner = Some(stamped);
        }
    }
    winner
}

/// Winning entries of every register in the map, keyed by field name.
pub fn read_all<T: ReadTxn>(map: &MapRef, txn: &T) -> HashMap<String, Stamped> {
    let mut winners: HashMap<String, Stamped> = HashMap::new();
    for (key, out) in map.iter(txn) {
        let Some((name, stamped)) = parse_entry(key, &out) else {
            continue;
        };
        match winners.get(&name) {
            Some(current) if !stamped.dominates(current) => {}
            _ => {
                winners.insert(name, stamped);
            }
        }
    }
    winners
}

/// Decode the winning value of one register.
pub fn read<T: ReadTxn, V: DeserializeOwned>(map: &MapRef, txn: &T, field: &str) -> Option<V> {
    read_entry(map, txn, field).and_then(|s| serde_json::from_value(s.value).ok())
}

/// Decode a field out of a [`read_all`] result.
pub fn decode<V: DeserializeOwned>(entries: &HashMap<String, Stamped>, field: &str) -> Option<V> {
    entries
        .get(field)
        .and_then(|s| serde_json::from_value(s.value.clone()).ok())
}

/// Write `value` to a register on behalf of `actor`.
///
/// The entry is stamped with `ts`, or with one more than the current winner
/// when that is larger, so the write always becomes visible locally.
/// Returns the timestamp actually used.
pub fn write(
    map: &MapRef,
    txn: &mut TransactionMut,
    field: &str,
    actor: &str,
    ts: u64,
    value: Value,
) -> Result<u64, DocumentError> {
    let own_key = entry_key(field, actor);
    let mut observed = Vec::new();
    let mut floor = 0u64;
    for (key, out) in map.iter(&*txn) {
        let Some((name, stamped)) = parse_entry(key, &out) else {
            continue;
        };
        if name == field {
            floor = floor.max(stamped.ts + 1);
            if key != own_key {
                observed.push(key.to_string());
            }
        }
    }

    let ts = ts.max(floor);
    let stamped = Stamped {
        ts,
        actor: actor.to_string(),
        value,
    };
    let encoded = serde_json::to_string(&stamped)?;

    for key in observed {
        map.remove(txn, &key);
    }
    map.insert(txn, own_key, encoded);
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::{Doc, Transact};

    fn stamped(ts: u64, actor: &str) -> Stamped {
        Stamped {
            ts,
            actor: actor.into(),
            value: Value::Null,
        }
    }

    #[test]
    fn test_dominates_orders_by_timestamp_then_actor() {
        assert!(stamped(2, "a").dominates(&stamped(1, "z")));
        assert!(stamped(1, "b").dominates(&stamped(1, "a")));
        assert!(!stamped(1, "a").dominates(&stamped(1, "a")));
    }

    #[test]
    fn test_write_then_read() {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("m");
        {
            let mut txn = doc.transact_mut();
            write(&map, &mut txn, "title", "alice", 5, json!("hello")).unwrap();
        }
        let txn = doc.transact();
        let title: Option<String> = read(&map, &txn, "title");
        assert_eq!(title.as_deref(), Some("hello"));
        assert!(read_entry(&map, &txn, "color").is_none());
    }

    #[test]
    fn test_write_dominates_observed_value() {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("m");
        let mut txn = doc.transact_mut();
        write(&map, &mut txn, "x", "zed", 10, json!(1)).unwrap();
        // A lower clock still wins because it observed ts=10
        let used = write(&map, &mut txn, "x", "amy", 3, json!(2)).unwrap();
        assert_eq!(used, 11);
        assert_eq!(read::<_, i64>(&map, &txn, "x"), Some(2));
        // The dominated entry was removed
        assert_eq!(map.len(&txn), 1);
    }

    #[test]
    fn test_read_all_picks_winner_per_field() {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("m");
        let mut txn = doc.transact_mut();
        write(&map, &mut txn, "a", "one", 1, json!("a1")).unwrap();
        write(&map, &mut txn, "b", "one", 1, json!("b1")).unwrap();
        map.insert(&mut txn, "plain", "not a register".to_string());
        let all = read_all(&map, &txn);
        assert_eq!(all.len(), 2);
        assert_eq!(decode::<String>(&all, "a").as_deref(), Some("a1"));
        assert_eq!(decode::<String>(&all, "b").as_deref(), Some("b1"));
    }
}
