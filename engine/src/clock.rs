//! Hybrid logical clock for ordering edits across replicas.
//!
//! An HLC is a 16-character base36 string: 8 characters of logical time
//! (milliseconds), 3 characters of counter, and a 5-character client id.
//! Every part is fixed width, so comparing two HLC strings
//! lexicographically compares them chronologically, with the client id as
//! the final tie-break.

use crate::{error::Result, hash::get_hash, Error, Time};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

const TIME_CHARS: usize = 8;
const COUNTER_CHARS: usize = 3;
const CLIENT_CHARS: usize = 5;

/// Length of every HLC string.
pub const HLC_LENGTH: usize = TIME_CHARS + COUNTER_CHARS + CLIENT_CHARS;

/// Largest encodable logical time (36^8 - 1 ms, some time in 2059).
pub const MAX_LOGICAL_TIME: u64 = 2_821_109_907_455;
/// Largest encodable counter (36^3 - 1).
pub const MAX_COUNTER: u32 = 46_655;
const CLIENT_SPACE: u64 = 60_466_176;

fn encode(mut n: u64, width: usize) -> String {
    let mut chars = vec![b'0'; width];
    for slot in chars.iter_mut().rev() {
        *slot = ALPHABET[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&chars).into_owned()
}

fn decode(text: &str) -> Option<u64> {
    text.bytes().try_fold(0u64, |n, b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'z' => b - b'a' + 10,
            _ => return None,
        };
        Some(n * 36 + u64::from(digit))
    })
}

/// Derive the 5-character client id for a unique id.
pub fn get_client_id(unique_id: &str) -> String {
    encode(u64::from(get_hash(unique_id)) % CLIENT_SPACE, CLIENT_CHARS)
}

/// Encode an HLC. Out-of-range parts are clamped.
pub fn encode_hlc(logical_time: u64, counter: u32, client_id: &str) -> Time {
    let client_id = if client_id.len() == CLIENT_CHARS && decode(client_id).is_some() {
        client_id.to_string()
    } else {
        get_client_id(client_id)
    };
    format!(
        "{}{}{}",
        encode(logical_time.min(MAX_LOGICAL_TIME), TIME_CHARS),
        encode(u64::from(counter.min(MAX_COUNTER)), COUNTER_CHARS),
        client_id
    )
}

/// Decode an HLC into `(logical_time, counter, client_id)`.
pub fn decode_hlc(hlc: &str) -> Result<(u64, u32, String)> {
    if hlc.len() != HLC_LENGTH || !hlc.is_ascii() {
        return Err(Error::InvalidHlc(hlc.to_string()));
    }
    let (time, rest) = hlc.split_at(TIME_CHARS);
    let (counter, client_id) = rest.split_at(COUNTER_CHARS);
    match (decode(time), decode(counter), decode(client_id)) {
        (Some(time), Some(counter), Some(_)) => {
            let counter = u32::try_from(counter).map_err(|_| Error::InvalidHlc(hlc.to_string()))?;
            Ok((time, counter, client_id.to_string()))
        }
        _ => Err(Error::InvalidHlc(hlc.to_string())),
    }
}

fn system_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A hybrid logical clock owned by one mergeable store.
///
/// Each clock carries its own state, so stores in one process never share a
/// clock.
pub struct HlcClock {
    client_id: String,
    logical_time: u64,
    last_counter: i64,
    now: Box<dyn Fn() -> u64>,
}

impl HlcClock {
    /// A clock reading the system time.
    pub fn new(unique_id: &str) -> Self {
        Self::with_time_source(unique_id, system_time_ms)
    }

    /// A clock reading physical time from `now` (milliseconds).
    pub fn with_time_source(unique_id: &str, now: impl Fn() -> u64 + 'static) -> Self {
        Self {
            client_id: get_client_id(unique_id),
            logical_time: 0,
            last_counter: -1,
            now: Box::new(now),
        }
    }

    /// The encoded client id suffix of every HLC this clock issues.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Issue an HLC strictly greater than every HLC issued or seen so far.
    pub fn next_hlc(&mut self) -> Time {
        self.observe(0, 0);
        self.last_counter += 1;
        if self.last_counter > i64::from(MAX_COUNTER) {
            self.logical_time += 1;
            self.last_counter = 0;
        }
        encode_hlc(
            self.logical_time,
            self.last_counter as u32,
            &self.client_id,
        )
    }

    /// Advance past a remote HLC. Empty or malformed HLCs only advance the
    /// clock to physical time.
    pub fn seen_hlc(&mut self, hlc: &str) {
        match decode_hlc(hlc) {
            Ok((time, counter, _)) => self.observe(time, i64::from(counter)),
            Err(_) => {
                if !hlc.is_empty() {
                    tracing::trace!(hlc, "ignoring malformed remote hlc");
                }
                self.observe(0, 0);
            }
        }
    }

    fn observe(&mut self, remote_time: u64, remote_counter: i64) {
        let previous = self.logical_time;
        self.logical_time = previous.max(remote_time).max((self.now)());
        self.last_counter = if self.logical_time == previous {
            if self.logical_time == remote_time {
                self.last_counter.max(remote_counter)
            } else {
                self.last_counter
            }
        } else if self.logical_time == remote_time {
            remote_counter
        } else {
            -1
        };
    }
}

impl fmt::Debug for HlcClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HlcClock")
            .field("client_id", &self.client_id)
            .field("logical_time", &self.logical_time)
            .field("last_counter", &self.last_counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;
    use std::rc::Rc;

    fn fixed_clock(unique_id: &str, time: u64) -> HlcClock {
        HlcClock::with_time_source(unique_id, move || time)
    }

    #[test]
    fn hlc_is_sixteen_chars() {
        let mut clock = HlcClock::new("node-1");
        assert_eq!(clock.next_hlc().len(), HLC_LENGTH);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let client_id = get_client_id("node-1");
        let hlc = encode_hlc(1_706_745_600_000, 42, &client_id);
        assert_eq!(decode_hlc(&hlc).unwrap(), (1_706_745_600_000, 42, client_id));
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(matches!(decode_hlc(""), Err(Error::InvalidHlc(_))));
        assert!(matches!(decode_hlc("zz"), Err(Error::InvalidHlc(_))));
        assert!(matches!(
            decode_hlc("ABCDEFGH00000000"),
            Err(Error::InvalidHlc(_))
        ));
    }

    #[test]
    fn string_order_is_time_order() {
        let client_id = get_client_id("node-1");
        let earlier = encode_hlc(1000, 5, &client_id);
        let later = encode_hlc(1001, 0, &client_id);
        let same_time_later = encode_hlc(1000, 6, &client_id);
        assert!(earlier < later);
        assert!(earlier < same_time_later);
        assert!(same_time_later < later);
    }

    #[test]
    fn counter_increments_when_time_stands_still() {
        let mut clock = fixed_clock("node-1", 1000);
        let mut previous = clock.next_hlc();
        assert_eq!(decode_hlc(&previous).unwrap().1, 0);
        for expected in 1..100 {
            let next = clock.next_hlc();
            assert!(next > previous);
            assert_eq!(decode_hlc(&next).unwrap().1, expected);
            previous = next;
        }
    }

    #[test]
    fn counter_resets_when_time_advances() {
        let now = Rc::new(StdCell::new(1000));
        let source = Rc::clone(&now);
        let mut clock = HlcClock::with_time_source("node-1", move || source.get());
        clock.next_hlc();
        clock.next_hlc();
        now.set(2000);
        let (time, counter, _) = decode_hlc(&clock.next_hlc()).unwrap();
        assert_eq!((time, counter), (2000, 0));
    }

    #[test]
    fn counter_overflow_advances_time() {
        let mut clock = fixed_clock("node-1", 1000);
        clock.last_counter = i64::from(MAX_COUNTER);
        clock.logical_time = 1000;
        let (time, counter, _) = decode_hlc(&clock.next_hlc()).unwrap();
        assert_eq!((time, counter), (1001, 0));
    }

    #[test]
    fn seen_hlc_advances_past_remote() {
        let mut clock = fixed_clock("local", 1000);
        let remote = encode_hlc(5000, 7, &get_client_id("remote"));
        clock.seen_hlc(&remote);
        let next = clock.next_hlc();
        assert!(next > remote);
        assert_eq!(decode_hlc(&next).unwrap().0, 5000);
        assert_eq!(decode_hlc(&next).unwrap().1, 8);
    }

    #[test]
    fn seen_older_hlc_does_not_rewind() {
        let mut clock = fixed_clock("local", 9000);
        let before = clock.next_hlc();
        clock.seen_hlc(&encode_hlc(10, 3, &get_client_id("remote")));
        assert!(clock.next_hlc() > before);
    }

    #[test]
    fn malformed_seen_hlc_is_ignored() {
        let mut clock = fixed_clock("local", 1000);
        let before = clock.next_hlc();
        clock.seen_hlc("not an hlc");
        clock.seen_hlc("");
        assert!(clock.next_hlc() > before);
    }

    #[test]
    fn client_ids_differ_and_are_stable() {
        assert_eq!(get_client_id("a"), get_client_id("a"));
        assert_ne!(get_client_id("a"), get_client_id("b"));
        let clock = HlcClock::new("a");
        assert_eq!(clock.client_id(), get_client_id("a"));
    }
}
