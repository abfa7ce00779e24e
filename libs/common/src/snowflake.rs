use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2026-01-01T00:00:00Z in milliseconds since Unix epoch.
const MURMUR_EPOCH_MS: u64 = 1_767_225_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
/// Largest worker id that fits the 10-bit worker field.
pub const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;

struct State {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit message id generator.
///
/// Layout (MSB → LSB):
/// - Bits 63–22: Timestamp (42 bits), ms since the Murmur epoch
/// - Bits 21–12: Worker ID (10 bits)
/// - Bits 11–0:  Sequence (12 bits), per-ms counter
///
/// Ids from one generator are strictly increasing. The delivery watermarks
/// compare message ids with `>`, so every process that persists messages
/// must run with a distinct worker id.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    pub fn new(worker_id: u16) -> Self {
        assert!(
            worker_id <= MAX_WORKER_ID,
            "worker_id must fit in {WORKER_BITS} bits"
        );
        Self {
            worker_id: worker_id as u64,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // A clock that steps backwards keeps issuing ids from the last seen
        // millisecond so ordering is never violated.
        let mut now_ms = current_ms().max(state.last_ms);

        if now_ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond.
                now_ms = state.last_ms + 1;
                while current_ms() < now_ms {
                    std::hint::spin_loop();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now_ms;

        let ts = now_ms.saturating_sub(MURMUR_EPOCH_MS);
        let id = (ts << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence;

        id as i64
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Extract the creation timestamp (ms since Unix epoch) from a message id.
pub fn snowflake_timestamp_ms(id: i64) -> u64 {
    let ts = (id as u64) >> (WORKER_BITS + SEQUENCE_BITS);
    ts + MURMUR_EPOCH_MS
}

/// Extract the worker id that generated a message id.
pub fn snowflake_worker(id: i64) -> u16 {
    (((id as u64) >> SEQUENCE_BITS) & MAX_WORKER_ID as u64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_unique_ids() {
        let gen = SnowflakeGenerator::new(0);
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = gen.generate();
            assert!(ids.insert(id), "duplicate snowflake: {id}");
        }
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let gen = SnowflakeGenerator::new(3);
        let mut prev = 0i64;
        for _ in 0..5_000 {
            let id = gen.generate();
            assert!(id > prev, "not monotonic: {prev} >= {id}");
            prev = id;
        }
    }

    #[test]
    fn timestamp_extraction() {
        let gen = SnowflakeGenerator::new(0);
        let before = current_ms();
        let id = gen.generate();
        let after = current_ms();

        let extracted = snowflake_timestamp_ms(id);
        assert!(
            extracted >= before && extracted <= after + 1,
            "extracted={extracted}, before={before}, after={after}"
        );
    }

    #[test]
    fn worker_id_is_embedded() {
        assert_eq!(snowflake_worker(SnowflakeGenerator::new(17).generate()), 17);
        assert_eq!(
            snowflake_worker(SnowflakeGenerator::new(MAX_WORKER_ID).generate()),
            MAX_WORKER_ID
        );
    }

    #[test]
    #[should_panic(expected = "worker_id must fit")]
    fn oversized_worker_id_is_rejected() {
        SnowflakeGenerator::new(1024 + 5);
    }

    #[test]
    fn backwards_clock_does_not_reorder() {
        let gen = SnowflakeGenerator::new(0);
        let first = gen.generate();
        // Pretend the last id was issued far in the future.
        gen.state.lock().unwrap().last_ms = current_ms() + 10_000;
        let second = gen.generate();
        assert!(second > first);
        assert!(snowflake_timestamp_ms(second) >= current_ms() + 9_000);
    }
}
