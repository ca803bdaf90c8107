use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;
use crate::clock::time_diff;

/// One direction of a simulated datagram channel that drops, duplicates and delays frames.
///
/// Each frame gets a random delay in `0..=max_delay_millis`, so frames overtake each other.
///  Randomness comes from a seeded RNG, which makes runs reproducible.
pub struct LossyLink {
    rng: StdRng,
    loss_rate: f64,
    duplicate_rate: f64,
    max_delay_millis: u32,
    /// (due time, frame), in insertion order
    in_flight: Vec<(u32, Vec<u8>)>,
    num_dropped: usize,
    num_duplicated: usize,
}

impl LossyLink {
    /// A link that delivers every frame immediately, until faults are configured
    pub fn new(seed: u64) -> LossyLink {
        LossyLink {
            rng: StdRng::seed_from_u64(seed),
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            max_delay_millis: 0,
            in_flight: Vec::new(),
            num_dropped: 0,
            num_duplicated: 0,
        }
    }

    pub fn with_loss_rate(mut self, loss_rate: f64) -> LossyLink {
        assert!((0.0..=1.0).contains(&loss_rate), "loss rate must be in [0, 1]");
        self.loss_rate = loss_rate;
        self
    }

    pub fn with_duplicate_rate(mut self, duplicate_rate: f64) -> LossyLink {
        assert!((0.0..=1.0).contains(&duplicate_rate), "duplicate rate must be in [0, 1]");
        self.duplicate_rate = duplicate_rate;
        self
    }

    pub fn with_max_delay_millis(mut self, max_delay_millis: u32) -> LossyLink {
        self.max_delay_millis = max_delay_millis;
        self
    }

    pub fn push(&mut self, frame: &[u8], now_millis: u32) {
        if self.rng.gen_bool(self.loss_rate) {
            trace!("dropping frame of {} bytes", frame.len());
            self.num_dropped += 1;
            return;
        }

        let copies = if self.rng.gen_bool(self.duplicate_rate) {
            self.num_duplicated += 1;
            2
        }
        else {
            1
        };

        for _ in 0..copies {
            let delay = self.rng.gen_range(0..=self.max_delay_millis);
            self.in_flight.push((now_millis.wrapping_add(delay), frame.to_vec()));
        }
    }

    /// Removes and returns all frames that are due at `now_millis`, earliest first
    pub fn deliver_due(&mut self, now_millis: u32) -> Vec<Vec<u8>> {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|(due_at, _)| time_diff(now_millis, *due_at) >= 0);
        self.in_flight = pending;

        // stable sort: frames due at the same time keep their order
        due.sort_by_key(|(due_at, _)| time_diff(*due_at, now_millis));
        due.into_iter()
            .map(|(_, frame)| frame)
            .collect()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn num_dropped(&self) -> usize {
        self.num_dropped
    }

    pub fn num_duplicated(&self) -> usize {
        self.num_duplicated
    }
}
