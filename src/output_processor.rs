//! Shapes the estimated position stream before it goes to an actuator.
//!
//! One [`OutputProcessor`] runs one of three strategies:
//!
//! - **raw**: every sample goes straight out;
//! - **buffered**: samples are collected into windows of `filter_time`, each
//!   window is simplified with [`reduce`], and the survivors are released
//!   `filter_time` after they were taken;
//! - **peak**: only direction reversals go out, plus a watchdog point when
//!   the motion keeps going one way for too long or stops at an extreme.
//!
//! Whatever the strategy, emitted points never go back in time and every
//! move duration sits between the configured floor and ceiling.

use clap::ValueEnum;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use std::{collections::VecDeque, fmt::Display, time::Duration};

use crate::component::{Component, ComponentError};
use crate::curve_reducer::{reduce, StrokerPoint};

/// Which shaping strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputStrategy {
    /// Forward every sample.
    Raw,
    /// Delay and simplify windows of samples.
    Buffered,
    /// Forward direction reversals only.
    Peak,
}

impl Display for OutputStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputStrategy::Raw => "raw",
            OutputStrategy::Buffered => "buffered",
            OutputStrategy::Peak => "peak",
        };
        write!(f, "{name}")
    }
}

/// Tunables for [`OutputProcessor`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    #[allow(missing_docs)]
    pub strategy: OutputStrategy,
    /// Window length and release delay of the buffered strategy.
    pub filter_time: Duration,
    /// Simplification tolerance of the buffered strategy.
    pub epsilon: f64,
    /// Shortest move duration ever handed out.
    pub duration_floor: Duration,
    /// Longest move duration ever handed out.
    pub duration_ceiling: Duration,
    /// Gaps longer than this are treated as a fresh start.
    pub max_gap: Duration,
    /// Taken off every measured gap to make up for delivery latency.
    pub latency_margin: Duration,
    /// Position change that counts as motion in peak mode.
    pub peak_noise_floor: f64,
    /// A peak this soon after the last one is suppressed if it is close by.
    pub peak_debounce_time: Duration,
    /// How close "close by" is.
    pub peak_debounce_distance: f64,
    /// Send a point anyway after moving one way for this long.
    pub peak_watchdog: Duration,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            strategy: OutputStrategy::Raw,
            filter_time: Duration::from_millis(500),
            epsilon: 0.02,
            duration_floor: Duration::from_millis(20),
            duration_ceiling: Duration::from_millis(500),
            max_gap: Duration::from_secs(1),
            latency_margin: Duration::from_millis(10),
            peak_noise_floor: 0.05,
            peak_debounce_time: Duration::from_millis(100),
            peak_debounce_distance: 0.1,
            peak_watchdog: Duration::from_millis(800),
        }
    }
}

/// One move for an actuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputEvent {
    /// Target position, 0.0 to 1.0.
    pub position: f64,
    /// How long the move should take.
    pub duration: Duration,
    /// When the point was taken, relative to the pipeline reference.
    pub at: Duration,
}

/// What the processor stage of the pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessorInput {
    /// A fresh position sample.
    Sample {
        #[allow(missing_docs)]
        position: f64,
        #[allow(missing_docs)]
        at: Duration,
    },
    /// Release anything that is due at this time.
    Drain(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone)]
enum StrategyState {
    Raw,
    Buffered {
        window: Vec<StrokerPoint>,
        queue: VecDeque<StrokerPoint>,
        first_window: bool,
        last_drained: Option<Duration>,
    },
    Peak {
        previous: Option<f64>,
        previous_at: Duration,
        direction: Direction,
        last_write: Duration,
        last_emitted: Option<f64>,
    },
}

/// The output shaping stage.
#[derive(Debug, Clone)]
pub struct OutputProcessor {
    settings: OutputSettings,
    state: StrategyState,
    last_emit: Option<Duration>,
    latest: Duration,
}

impl OutputProcessor {
    /// Build a processor. Buffering with no window or no tolerance would be
    /// a slow passthrough, so it runs as raw instead.
    pub fn new(settings: OutputSettings) -> Self {
        let state = match settings.strategy {
            OutputStrategy::Buffered
                if settings.filter_time.is_zero() || settings.epsilon <= 0.0 =>
            {
                debug!("buffered output without a window, falling back to raw");
                StrategyState::Raw
            }
            OutputStrategy::Raw => StrategyState::Raw,
            OutputStrategy::Buffered => StrategyState::Buffered {
                window: Vec::new(),
                queue: VecDeque::new(),
                first_window: true,
                last_drained: None,
            },
            OutputStrategy::Peak => StrategyState::Peak {
                previous: None,
                previous_at: Duration::ZERO,
                direction: Direction::None,
                last_write: Duration::ZERO,
                last_emitted: None,
            },
        };
        Self {
            settings,
            state,
            last_emit: None,
            latest: Duration::ZERO,
        }
    }

    #[allow(missing_docs)]
    pub fn settings(&self) -> &OutputSettings {
        &self.settings
    }

    /// Move duration for a point `gap` after the previous one.
    fn move_duration(&self, gap: Option<Duration>) -> Duration {
        let s = &self.settings;
        match gap {
            Some(gap) if gap <= s.max_gap => gap
                .saturating_sub(s.latency_margin)
                .max(s.duration_floor)
                .min(s.duration_ceiling),
            _ => s.duration_ceiling,
        }
    }

    fn emit(&mut self, position: f64, at: Duration) -> OutputEvent {
        let gap = self.last_emit.map(|last| at.saturating_sub(last));
        let duration = self.move_duration(gap);
        self.last_emit = Some(at);
        OutputEvent {
            position: position.clamp(0.0, 1.0),
            duration,
            at,
        }
    }

    /// Feed one sample taken at `at`. Returns whatever became ready.
    pub fn push(&mut self, position: f64, at: Duration) -> Vec<OutputEvent> {
        let at = at.max(self.latest);
        self.latest = at;
        let position = position.clamp(0.0, 1.0);

        match self.state {
            StrategyState::Raw => vec![self.emit(position, at)],
            StrategyState::Buffered { .. } => {
                self.buffer(position, at);
                self.drain(at)
            }
            StrategyState::Peak { .. } => self.peak(position, at).into_iter().collect(),
        }
    }

    fn buffer(&mut self, position: f64, at: Duration) {
        let filter_time = self.settings.filter_time;
        let epsilon = self.settings.epsilon;
        let StrategyState::Buffered {
            window,
            queue,
            first_window,
            ..
        } = &mut self.state
        else {
            return;
        };

        window.push(StrokerPoint::new(position, at));
        if at.saturating_sub(window[0].time) <= filter_time {
            return;
        }

        let reduced = reduce(window, epsilon);
        trace!("window of {} points reduced to {}", window.len(), reduced.len());
        let skip = if *first_window { 0 } else { 1 };
        queue.extend(reduced.iter().skip(skip).copied());
        *first_window = false;
        window.clear();
        if let Some(&last) = reduced.last() {
            window.push(last);
        }
    }

    fn peak(&mut self, position: f64, at: Duration) -> Option<OutputEvent> {
        let s = &self.settings;
        let (noise_floor, debounce_time, debounce_distance, watchdog) = (
            s.peak_noise_floor,
            s.peak_debounce_time,
            s.peak_debounce_distance,
            s.peak_watchdog,
        );
        let StrategyState::Peak {
            previous,
            previous_at,
            direction,
            last_write,
            last_emitted,
        } = &mut self.state
        else {
            return None;
        };

        let Some(prev) = *previous else {
            *previous = Some(position);
            *previous_at = at;
            *last_write = at;
            return None;
        };

        let since_write = at.saturating_sub(*last_write);
        let overdue = since_write > watchdog;
        let mut send = false;
        match *direction {
            Direction::Up if position <= prev || overdue => {
                send = true;
                if position <= prev {
                    *direction = Direction::None;
                }
            }
            Direction::Down if position >= prev || overdue => {
                send = true;
                if position >= prev {
                    *direction = Direction::None;
                }
            }
            _ => {}
        }

        let candidate = prev;
        if send
            && since_write < debounce_time
            && last_emitted.is_some_and(|last| (candidate - last).abs() <= debounce_distance)
        {
            trace!("peak at {candidate:.2} debounced");
            *last_write = at;
            send = false;
        }

        let delta = position - prev;
        if delta.abs() > noise_floor {
            *direction = if delta > 0.0 {
                Direction::Up
            } else {
                Direction::Down
            };
        }
        if *direction != Direction::None {
            *previous = Some(position);
            *previous_at = at;
        }

        if !send {
            return None;
        }
        *last_write = at;
        *last_emitted = Some(candidate);
        Some(self.emit(candidate, at))
    }

    /// Release whatever is due at `now`. The buffered strategy releases every
    /// point taken at least `filter_time` before `now`. The peak strategy
    /// releases the extreme it is sitting on once nothing has been sent for
    /// `peak_watchdog`.
    pub fn drain(&mut self, now: Duration) -> Vec<OutputEvent> {
        if let StrategyState::Peak { .. } = self.state {
            return self.peak_watchdog(now).into_iter().collect();
        }

        let threshold = now.saturating_sub(self.settings.filter_time);
        let mut due = Vec::new();
        if let StrategyState::Buffered {
            queue,
            last_drained,
            ..
        } = &mut self.state
        {
            while let Some(point) = queue.front() {
                if point.time > threshold {
                    break;
                }
                let gap = last_drained.map(|last| point.time.saturating_sub(last));
                *last_drained = Some(point.time);
                due.push((*point, gap));
                queue.pop_front();
            }
        }

        due.into_iter()
            .map(|(point, gap)| {
                self.last_emit = Some(point.time);
                OutputEvent {
                    position: point.position,
                    duration: self.move_duration(gap),
                    at: point.time,
                }
            })
            .collect()
    }
}

impl OutputProcessor {
    fn peak_watchdog(&mut self, now: Duration) -> Option<OutputEvent> {
        let watchdog = self.settings.peak_watchdog;
        let StrategyState::Peak {
            previous: Some(prev),
            previous_at,
            direction,
            last_write,
            last_emitted,
        } = &mut self.state
        else {
            return None;
        };
        if *direction == Direction::None || now.saturating_sub(*last_write) <= watchdog {
            return None;
        }

        let (position, at) = (*prev, *previous_at);
        trace!("peak watchdog releasing {position:.2}");
        *direction = Direction::None;
        *last_write = now;
        *last_emitted = Some(position);
        let at = self.last_emit.map_or(at, |last| at.max(last));
        Some(self.emit(position, at))
    }
}

impl Display for OutputProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutputProcessor({})", self.settings.strategy)
    }
}

impl Component for OutputProcessor {
    type InData = ProcessorInput;
    type OutData = OutputEvent;

    fn convert(&mut self, input: ProcessorInput) -> Vec<OutputEvent> {
        match input {
            ProcessorInput::Sample { position, at } => self.push(position, at),
            ProcessorInput::Drain(now) => self.drain(now),
        }
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        match &self.state {
            StrategyState::Buffered { queue, .. } if !queue.is_empty() => Err(
                ComponentError::Unfinished(format!("{} points never released", queue.len())),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn processor(strategy: OutputStrategy) -> OutputProcessor {
        OutputProcessor::new(OutputSettings {
            strategy,
            ..OutputSettings::default()
        })
    }

    #[test]
    fn raw_forwards_in_order() {
        let mut p = processor(OutputStrategy::Raw);
        let mut out = Vec::new();
        for i in 0..10 {
            out.extend(p.push(i as f64 / 10.0, ms(i * 50)));
        }
        assert_eq!(out.len(), 10);
        for (i, e) in out.iter().enumerate() {
            assert!((e.position - i as f64 / 10.0).abs() < 1e-9);
            assert!(e.duration >= OutputSettings::default().duration_floor);
        }
        assert!(out.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[test]
    fn raw_durations_follow_the_gap() {
        let mut p = processor(OutputStrategy::Raw);
        assert_eq!(p.push(0.1, ms(1000))[0].duration, ms(500));
        assert_eq!(p.push(0.2, ms(1100))[0].duration, ms(90));
        assert_eq!(p.push(0.3, ms(1105))[0].duration, ms(20));
        assert_eq!(p.push(0.4, ms(1900))[0].duration, ms(500));
        assert_eq!(p.push(0.5, ms(4000))[0].duration, ms(500));
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let mut p = processor(OutputStrategy::Raw);
        p.push(0.5, ms(100));
        let late = p.push(0.6, ms(50));
        assert_eq!(late[0].at, ms(100));
    }

    #[test]
    fn peak_mode_emits_top_and_bottom() {
        let mut p = processor(OutputStrategy::Peak);
        let mut out = Vec::new();
        let stroke = [0.2, 0.4, 0.6, 0.8, 0.6, 0.4, 0.2];
        for (i, &pos) in stroke.iter().enumerate() {
            out.extend(p.push(pos, ms(i as u64 * 100)));
        }
        assert_eq!(out.len(), 1);
        assert!(p.drain(ms(900)).is_empty());
        out.extend(p.drain(ms(3000)));
        assert!(p.drain(ms(6000)).is_empty());

        let positions: Vec<f64> = out.iter().map(|e| e.position).collect();
        assert_eq!(positions.len(), 2);
        assert!((positions[0] - 0.8).abs() < 1e-9);
        assert!((positions[1] - 0.2).abs() < 1e-9);
        assert_eq!(out[1].at, ms(600));
        assert!(out[0].at < out[1].at);
    }

    #[test]
    fn peak_mode_reversal_after_a_pause() {
        let mut p = processor(OutputStrategy::Peak);
        let mut out = Vec::new();
        for (t, pos) in [(0, 0.2), (100, 0.5), (200, 0.8), (300, 0.5)] {
            out.extend(p.push(pos, ms(t)));
        }
        out.extend(p.drain(ms(1200)));
        out.extend(p.push(0.6, ms(1300)));
        out.extend(p.push(0.9, ms(1400)));
        out.extend(p.push(0.7, ms(1500)));

        let positions: Vec<f64> = out.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0.8, 0.5, 0.9]);
    }

    #[test]
    fn peak_mode_waits_for_first_sample() {
        let mut p = processor(OutputStrategy::Peak);
        assert!(p.push(0.9, ms(0)).is_empty());
        assert!(p.drain(ms(10_000)).is_empty());
    }

    #[test]
    fn peak_jitter_is_debounced() {
        let mut p = processor(OutputStrategy::Peak);
        let mut out = Vec::new();
        for (t, pos) in [(0, 0.5), (10, 0.6), (20, 0.55), (30, 0.7), (40, 0.65)] {
            out.extend(p.push(pos, ms(t)));
        }
        assert_eq!(out.len(), 1);
        assert!((out[0].position - 0.6).abs() < 1e-9);
    }

    #[test]
    fn peak_watchdog_fires_on_long_strokes() {
        let mut p = processor(OutputStrategy::Peak);
        assert!(p.push(0.1, ms(0)).is_empty());
        assert!(p.push(0.3, ms(100)).is_empty());
        let out = p.push(0.5, ms(1000));
        assert_eq!(out.len(), 1);
        assert!((out[0].position - 0.3).abs() < 1e-9);
    }

    #[test]
    fn buffered_delays_and_simplifies() {
        let mut p = OutputProcessor::new(OutputSettings {
            strategy: OutputStrategy::Buffered,
            filter_time: ms(200),
            epsilon: 0.01,
            ..OutputSettings::default()
        });
        let mut out = Vec::new();
        for t in (0..=1000).step_by(20) {
            let now = ms(t);
            for e in p.push(t as f64 / 2000.0, now) {
                assert!(e.at + ms(200) <= now);
                out.push(e);
            }
        }
        out.extend(p.drain(ms(2000)));

        let times: Vec<Duration> = out.iter().map(|e| e.at).collect();
        assert_eq!(times, vec![ms(0), ms(220), ms(440), ms(660), ms(880)]);
        assert_eq!(out[0].duration, ms(500));
        assert_eq!(out[1].duration, ms(210));
        assert!((out[4].position - 0.44).abs() < 1e-9);
    }

    #[test]
    fn buffered_without_window_is_raw() {
        let mut p = OutputProcessor::new(OutputSettings {
            strategy: OutputStrategy::Buffered,
            filter_time: Duration::ZERO,
            ..OutputSettings::default()
        });
        assert_eq!(p.push(0.3, ms(5)).len(), 1);
    }

    #[test]
    fn finalize_reports_points_never_released() {
        let mut p = OutputProcessor::new(OutputSettings {
            strategy: OutputStrategy::Buffered,
            filter_time: ms(200),
            epsilon: 0.01,
            ..OutputSettings::default()
        });
        for t in (0..=300).step_by(20) {
            p.push(t as f64 / 1000.0, ms(t));
        }
        assert!(matches!(p.finalize(), Err(ComponentError::Unfinished(_))));

        p.drain(ms(10_000));
        assert!(p.finalize().is_ok());
    }

    #[test]
    fn drain_before_any_sample_is_empty() {
        let mut p = processor(OutputStrategy::Buffered);
        assert!(p.drain(ms(60_000)).is_empty());
    }
}
