//! Closed-loop quality control for one stream.
//!
//! Every tick the stream feeds one sample (transport figures plus encoder
//! latency) into bounded rolling windows; the averages are classified into
//! good / fair / poor and turned into at most one quality change.

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::QualityConfig;
use crate::types::{QualityTuple, StreamOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Good,
    Fair,
    Poor,
}

impl Health {
    fn classify(value: f64, fair: f64, poor: f64) -> Self {
        if value >= poor {
            Health::Poor
        } else if value >= fair {
            Health::Fair
        } else {
            Health::Good
        }
    }
}

/// Measurements taken at one tick. Missing figures are simply not recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualitySample {
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    /// Fraction, 0.0..=1.0
    pub packet_loss: Option<f64>,
    pub encode_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub from: QualityTuple,
    pub to: QualityTuple,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualitySnapshot {
    pub current: QualityTuple,
    pub network: Option<Health>,
    pub encoding: Option<Health>,
    pub avg_rtt_ms: Option<f64>,
    pub avg_jitter_ms: Option<f64>,
    pub avg_packet_loss: Option<f64>,
    pub avg_encode_latency_ms: Option<f64>,
    pub adjustments: u64,
}

struct Window {
    samples: VecDeque<f64>,
    size: usize,
}

impl Window {
    fn new(size: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(size),
            size: size.max(1),
        }
    }

    fn push(&mut self, value: Option<f64>) {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return;
        };
        if self.samples.len() == self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}

pub struct QualityController {
    config: QualityConfig,
    current: QualityTuple,
    max_bitrate_kbps: u32,
    max_frame_rate: u32,
    rtt: Window,
    jitter: Window,
    loss: Window,
    encode: Window,
    adjustments: u64,
}

impl QualityController {
    pub fn new(config: QualityConfig, initial: QualityTuple, options: &StreamOptions) -> Self {
        let size = config.window_size;
        let mut controller = Self {
            current: initial,
            max_bitrate_kbps: config.max_bitrate_kbps,
            max_frame_rate: config.max_frame_rate,
            rtt: Window::new(size),
            jitter: Window::new(size),
            loss: Window::new(size),
            encode: Window::new(size),
            adjustments: 0,
            config,
        };
        controller.set_ceiling(options);
        controller
    }

    pub fn current(&self) -> QualityTuple {
        self.current
    }

    /// Stream-level ceilings; unset fields keep the configured bounds.
    pub fn set_ceiling(&mut self, options: &StreamOptions) {
        if let Some(max) = options.max_bitrate_kbps {
            self.max_bitrate_kbps = max.max(self.config.min_bitrate_kbps);
        }
        if let Some(max) = options.max_frame_rate {
            self.max_frame_rate = max.max(self.config.min_frame_rate);
        }
    }

    /// Replaces the baseline after an explicit reconfiguration.
    pub fn set_baseline(&mut self, quality: QualityTuple) {
        self.current = quality;
    }

    pub fn record(&mut self, sample: QualitySample) {
        self.rtt.push(sample.rtt_ms);
        self.jitter.push(sample.jitter_ms);
        self.loss.push(sample.packet_loss);
        self.encode.push(sample.encode_latency_ms);
    }

    pub fn network_health(&self) -> Option<Health> {
        let c = &self.config;
        [
            self.rtt
                .average()
                .map(|v| Health::classify(v, c.rtt_fair_ms, c.rtt_poor_ms)),
            self.jitter
                .average()
                .map(|v| Health::classify(v, c.jitter_fair_ms, c.jitter_poor_ms)),
            self.loss
                .average()
                .map(|v| Health::classify(v, c.loss_fair, c.loss_poor)),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    pub fn encoding_health(&self) -> Option<Health> {
        self.encode
            .average()
            .map(|v| Health::classify(v, self.config.encode_fair_ms, self.config.encode_poor_ms))
    }

    /// Records the sample and decides. Returns the change to apply, None when
    /// there is nothing to judge yet or the numbers stay the same.
    pub fn tick(&mut self, sample: QualitySample) -> Option<Adjustment> {
        self.record(sample);
        self.evaluate()
    }

    pub fn evaluate(&mut self) -> Option<Adjustment> {
        let worst = [self.network_health(), self.encoding_health()]
            .into_iter()
            .flatten()
            .max()?;

        let c = &self.config;
        let from = self.current;
        let mut to = from;
        match worst {
            Health::Poor => {
                to.bitrate_kbps = scale_down(from.bitrate_kbps, c.decrease_factor, c.min_bitrate_kbps);
                to.frame_rate = scale_down(from.frame_rate, c.decrease_factor, c.min_frame_rate);
            }
            Health::Fair => {
                to.bitrate_kbps = scale_down(from.bitrate_kbps, c.fair_decrease_factor, c.min_bitrate_kbps);
            }
            Health::Good => {
                to.bitrate_kbps = scale_up(from.bitrate_kbps, c.increase_factor, self.max_bitrate_kbps);
                to.frame_rate = scale_up(from.frame_rate, c.increase_factor, self.max_frame_rate);
            }
        }

        if to == from {
            return None;
        }
        self.current = to;
        self.adjustments += 1;
        log::debug!(
            "quality {:?}: {}kbps@{}fps -> {}kbps@{}fps",
            worst,
            from.bitrate_kbps,
            from.frame_rate,
            to.bitrate_kbps,
            to.frame_rate
        );
        Some(Adjustment { from, to })
    }

    pub fn snapshot(&self) -> QualitySnapshot {
        QualitySnapshot {
            current: self.current,
            network: self.network_health(),
            encoding: self.encoding_health(),
            avg_rtt_ms: self.rtt.average(),
            avg_jitter_ms: self.jitter.average(),
            avg_packet_loss: self.loss.average(),
            avg_encode_latency_ms: self.encode.average(),
            adjustments: self.adjustments,
        }
    }
}

/// Never goes up, never below `floor` unless already there.
fn scale_down(value: u32, factor: f64, floor: u32) -> u32 {
    let scaled = (value as f64 * factor).round() as u32;
    scaled.max(floor).min(value)
}

/// Never goes down, never above `ceiling` unless already there.
fn scale_up(value: u32, factor: f64, ceiling: u32) -> u32 {
    let scaled = (value as f64 * factor).round() as u32;
    scaled.min(ceiling).max(value)
}

#[cfg(test)]
#[path = "quality_test.rs"]
mod quality_test;
