use std::ops::RangeInclusive;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::sleep;

use crate::config::PacingSection;

/// Paces keystrokes and clicks so form input lands at a human rhythm instead
/// of one synthetic burst.
#[derive(Debug, Clone)]
pub struct InputPacer {
    config: PacingSection,
}

impl InputPacer {
    pub fn new(config: PacingSection) -> Self {
        Self { config }
    }

    pub async fn before_click(&self) {
        let hesitation = random_duration(self.config.click_hesitation_ms);
        sleep(hesitation).await;
    }

    pub async fn between_keys(&self) {
        sleep(self.typing_delay()).await;
    }

    fn typing_delay(&self) -> Duration {
        let mut rng = thread_rng();
        let cadence_range = RangeInclusive::new(
            self.config.typing_cadence_cpm[0].min(self.config.typing_cadence_cpm[1]),
            self.config.typing_cadence_cpm[0].max(self.config.typing_cadence_cpm[1]),
        );
        let cadence = rng.gen_range(cadence_range).max(60) as f64;
        let chars_per_second = cadence / 60.0;
        let base_delay = 1.0 / chars_per_second;
        let jitter_range = RangeInclusive::new(
            self.config.typing_jitter_ms[0].min(self.config.typing_jitter_ms[1]),
            self.config.typing_jitter_ms[0].max(self.config.typing_jitter_ms[1]),
        );
        let jitter_ms = rng.gen_range(jitter_range);
        Duration::from_secs_f64(base_delay + jitter_ms as f64 / 1000.0)
    }
}

fn random_duration(bounds: [u32; 2]) -> Duration {
    let lower = bounds[0].min(bounds[1]);
    let upper = bounds[0].max(bounds[1]);
    let ms = thread_rng().gen_range(lower..=upper) as u64;
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_delay_tracks_the_configured_cadence() {
        let pacer = InputPacer::new(PacingSection {
            typing_cadence_cpm: [300, 300],
            typing_jitter_ms: [10, 10],
            click_hesitation_ms: [0, 0],
        });
        let delay = pacer.typing_delay();
        assert_eq!(delay, Duration::from_secs_f64(0.2 + 0.01));
    }

    #[test]
    fn typing_delay_stays_within_the_jitter_envelope() {
        let pacer = InputPacer::new(PacingSection::default());
        for _ in 0..32 {
            let delay = pacer.typing_delay();
            // 420 cpm floor ~= 143ms, 280 cpm ceiling ~= 214ms, plus jitter.
            assert!(delay >= Duration::from_millis(140));
            assert!(delay <= Duration::from_millis(280));
        }
    }
}
