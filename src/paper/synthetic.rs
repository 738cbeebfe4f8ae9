use crate::models::{Candle, Interval};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Per-tick price change bound (±0.2%)
const TICK_NOISE_PCT: f64 = 0.002;

/// Seeded random-walk candle generator
pub struct RandomWalk {
    rng: StdRng,
    base_volume: f64,
}

impl RandomWalk {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_volume: 1_000.0,
        }
    }

    /// Uniform sample in `[0, 1)`
    pub fn sample(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    fn step(&mut self, price: f64) -> f64 {
        let next = price * (1.0 + self.rng.gen_range(-TICK_NOISE_PCT..TICK_NOISE_PCT));
        next.max(0.0001)
    }

    /// A flat bar opening at `open`, ready to receive ticks
    pub fn open_bar(time: i64, open: f64) -> Candle {
        Candle {
            time,
            open,
            high: open,
            low: open,
            close: open,
            volume: 0.0,
            turnover: 0.0,
        }
    }

    /// Move the bar's close one step and account the traded volume
    pub fn tick(&mut self, candle: &mut Candle) {
        let close = self.step(candle.close);
        // Vary volume ±30%
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3) / 10.0;

        candle.close = close;
        candle.high = candle.high.max(close);
        candle.low = candle.low.min(close);
        candle.volume += volume;
        candle.turnover += volume * close;
    }

    /// A complete bar built from a handful of ticks
    pub fn bar(&mut self, time: i64, open: f64) -> Candle {
        let mut candle = Self::open_bar(time, open);
        for _ in 0..10 {
            self.tick(&mut candle);
        }
        candle
    }

    /// `count` consecutive bars, oldest first, the last one opening at
    /// `last_open` and still in progress
    ///
    /// # Arguments
    /// * `last_open` - Open time (epoch ms) of the current bucket
    /// * `base_price` - Open price of the oldest bar
    pub fn history(
        &mut self,
        interval: Interval,
        last_open: i64,
        count: usize,
        base_price: f64,
    ) -> Vec<Candle> {
        let step = interval.as_millis();
        let mut candles = Vec::with_capacity(count);
        let mut price = base_price;

        for i in (0..count).rev() {
            let time = last_open - i as i64 * step;
            let candle = if i == 0 {
                let mut open = Self::open_bar(time, price);
                self.tick(&mut open);
                open
            } else {
                self.bar(time, price)
            };
            price = candle.close;
            candles.push(candle);
        }

        candles
    }
}

/// Open time of the bucket containing `now_ms`
pub fn bucket_start(now_ms: i64, interval: Interval) -> i64 {
    let step = interval.as_millis();
    now_ms - now_ms.rem_euclid(step)
}
