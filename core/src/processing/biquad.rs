//! Coefficient design for the IIR filters applied to live chunks.
//!
//! Every filter is expressed as a cascade of normalised second-order
//! sections. Lowpass and highpass filters are Butterworth designs of any
//! order; band filters are built from those, and the notch is a
//! finite-depth peaking cut whose depth grows with the quality factor.

use crate::prelude::{StreamError, StreamResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const MAX_ORDER: usize = 16;

fn default_order() -> usize {
    2
}

/// Filter type and its frequency parameters in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterKind {
    Lowpass { cutoff: f64 },
    Highpass { cutoff: f64 },
    Bandpass { low: f64, high: f64 },
    Bandstop { low: f64, high: f64 },
    Notch { freq: f64, quality: f64 },
}

impl FilterKind {
    pub fn short_name(&self) -> &'static str {
        match self {
            FilterKind::Lowpass { .. } => "LP",
            FilterKind::Highpass { .. } => "HP",
            FilterKind::Bandpass { .. } => "BP",
            FilterKind::Bandstop { .. } => "BS",
            FilterKind::Notch { .. } => "NO",
        }
    }

    fn highest_frequency(&self) -> f64 {
        match *self {
            FilterKind::Lowpass { cutoff } | FilterKind::Highpass { cutoff } => cutoff,
            FilterKind::Bandpass { high, .. } | FilterKind::Bandstop { high, .. } => high,
            FilterKind::Notch { freq, .. } => freq,
        }
    }
}

/// Declarative filter description.
///
/// `sampling_rate` may be left unset in configuration files; it is bound to
/// the stream's rate when the filter is activated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(flatten)]
    pub kind: FilterKind,
    #[serde(default = "default_order")]
    pub order: usize,
    #[serde(default)]
    pub sampling_rate: Option<f64>,
}

impl FilterSpec {
    pub fn new(kind: FilterKind, order: usize) -> Self {
        Self {
            kind,
            order,
            sampling_rate: None,
        }
    }

    pub fn lowpass(cutoff: f64, order: usize) -> Self {
        Self::new(FilterKind::Lowpass { cutoff }, order)
    }

    pub fn highpass(cutoff: f64, order: usize) -> Self {
        Self::new(FilterKind::Highpass { cutoff }, order)
    }

    pub fn bandpass(low: f64, high: f64, order: usize) -> Self {
        Self::new(FilterKind::Bandpass { low, high }, order)
    }

    pub fn bandstop(low: f64, high: f64, order: usize) -> Self {
        Self::new(FilterKind::Bandstop { low, high }, order)
    }

    pub fn notch(freq: f64, quality: f64) -> Self {
        Self::new(FilterKind::Notch { freq, quality }, 2)
    }

    pub fn with_sampling_rate(mut self, sampling_rate: f64) -> Self {
        self.sampling_rate = Some(sampling_rate);
        self
    }

    /// Fixes the sampling rate to the stream's, rejecting a filter that was
    /// written for a different rate.
    pub fn bind(&self, stream_rate: f64) -> StreamResult<FilterSpec> {
        match self.sampling_rate {
            Some(rate) if (rate - stream_rate).abs() > 1e-9 * stream_rate.max(1.0) => {
                Err(StreamError::InvalidFilter(format!(
                    "{} filter designed for {} Hz on a {} Hz stream",
                    self.kind.short_name(),
                    rate,
                    stream_rate
                )))
            }
            _ => Ok(self.clone().with_sampling_rate(stream_rate)),
        }
    }

    pub fn design(&self) -> StreamResult<FilterDesign> {
        FilterDesign::new(self)
    }
}

/// Normalised second-order section (a0 == 1). First-order sections carry
/// zero `b[2]` and `a[1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Section {
    pub b: [f64; 3],
    pub a: [f64; 2],
}

impl Section {
    fn from_raw(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b: [b0 / a0, b1 / a0, b2 / a0],
            a: [a1 / a0, a2 / a0],
        }
    }

    /// Both poles strictly inside the unit circle (stability triangle).
    pub fn is_stable(&self) -> bool {
        let [a1, a2] = self.a;
        a1.is_finite() && a2.is_finite() && a2.abs() < 1.0 && a1.abs() < 1.0 + a2
    }

    pub fn dc_gain(&self) -> f64 {
        let [b0, b1, b2] = self.b;
        let [a1, a2] = self.a;
        (b0 + b1 + b2) / (1.0 + a1 + a2)
    }

    /// Complex response at normalised angular frequency `omega`.
    pub fn response(&self, omega: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -omega);
        let z2 = z1 * z1;
        let [b0, b1, b2] = self.b;
        let [a1, a2] = self.a;
        (b0 + z1 * b1 + z2 * b2) / (1.0 + z1 * a1 + z2 * a2)
    }

    fn lowpass(omega: f64, q: f64) -> Self {
        let (sn, cs) = omega.sin_cos();
        let alpha = sn / (2.0 * q);
        Self::from_raw(
            (1.0 - cs) / 2.0,
            1.0 - cs,
            (1.0 - cs) / 2.0,
            1.0 + alpha,
            -2.0 * cs,
            1.0 - alpha,
        )
    }

    fn highpass(omega: f64, q: f64) -> Self {
        let (sn, cs) = omega.sin_cos();
        let alpha = sn / (2.0 * q);
        Self::from_raw(
            (1.0 + cs) / 2.0,
            -(1.0 + cs),
            (1.0 + cs) / 2.0,
            1.0 + alpha,
            -2.0 * cs,
            1.0 - alpha,
        )
    }

    fn lowpass_first_order(omega: f64) -> Self {
        let k = (omega / 2.0).tan();
        Self::from_raw(k, k, 0.0, 1.0 + k, k - 1.0, 0.0)
    }

    fn highpass_first_order(omega: f64) -> Self {
        let k = (omega / 2.0).tan();
        Self::from_raw(1.0, -1.0, 0.0, 1.0 + k, k - 1.0, 0.0)
    }

    fn band_reject(omega: f64, q: f64) -> Self {
        let (sn, cs) = omega.sin_cos();
        let alpha = sn / (2.0 * q);
        Self::from_raw(1.0, -2.0 * cs, 1.0, 1.0 + alpha, -2.0 * cs, 1.0 - alpha)
    }

    /// Peaking cut with linear gain `depth` at `omega` and unity gain at DC
    /// and Nyquist.
    fn peaking_cut(omega: f64, q: f64, depth: f64) -> Self {
        let (sn, cs) = omega.sin_cos();
        let alpha = sn / (2.0 * q);
        let amp = depth.sqrt();
        Self::from_raw(
            1.0 + alpha * amp,
            -2.0 * cs,
            1.0 - alpha * amp,
            1.0 + alpha / amp,
            -2.0 * cs,
            1.0 - alpha / amp,
        )
    }
}

/// Butterworth pole-pair quality factors for a given order.
fn butterworth_qs(order: usize) -> Vec<f64> {
    (0..order / 2)
        .map(|k| 1.0 / (2.0 * (PI * (2 * k + 1) as f64 / (2 * order) as f64).sin()))
        .collect()
}

fn butterworth(omega: f64, order: usize, highpass: bool) -> Vec<Section> {
    let mut sections: Vec<Section> = butterworth_qs(order)
        .into_iter()
        .map(|q| {
            if highpass {
                Section::highpass(omega, q)
            } else {
                Section::lowpass(omega, q)
            }
        })
        .collect();
    if order % 2 == 1 {
        sections.push(if highpass {
            Section::highpass_first_order(omega)
        } else {
            Section::lowpass_first_order(omega)
        });
    }
    sections
}

/// Linear gain at the centre of a notch of quality `q` at `omega`.
pub fn notch_depth(omega: f64, q: f64) -> f64 {
    let d = omega / (2.0 * q);
    d / (1.0 + d)
}

fn positive(name: &str, value: f64) -> StreamResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(StreamError::InvalidFilter(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}

/// Coefficients derived from a bound `FilterSpec`. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDesign {
    spec: FilterSpec,
    sampling_rate: f64,
    sections: Vec<Section>,
}

impl FilterDesign {
    pub fn new(spec: &FilterSpec) -> StreamResult<Self> {
        let sampling_rate = positive(
            "sampling rate",
            spec.sampling_rate.ok_or_else(|| {
                StreamError::InvalidFilter("sampling rate not bound".to_string())
            })?,
        )?;
        if !matches!(spec.kind, FilterKind::Notch { .. })
            && (spec.order == 0 || spec.order > MAX_ORDER)
        {
            return Err(StreamError::InvalidFilter(format!(
                "order must be within 1..={}, got {}",
                MAX_ORDER, spec.order
            )));
        }

        let top = positive("frequency", spec.kind.highest_frequency())?;
        if sampling_rate <= 2.0 * top {
            return Err(StreamError::UnstableFilter(format!(
                "{} filter at {} Hz needs a sampling rate above {} Hz, got {}",
                spec.kind.short_name(),
                top,
                2.0 * top,
                sampling_rate
            )));
        }
        let omega = |freq: f64| 2.0 * PI * freq / sampling_rate;

        let sections = match spec.kind {
            FilterKind::Lowpass { cutoff } => butterworth(omega(cutoff), spec.order, false),
            FilterKind::Highpass { cutoff } => butterworth(omega(cutoff), spec.order, true),
            FilterKind::Bandpass { low, high } | FilterKind::Bandstop { low, high } => {
                positive("lower band edge", low)?;
                if low >= high {
                    return Err(StreamError::InvalidFilter(format!(
                        "band edges must satisfy low < high, got {} and {}",
                        low, high
                    )));
                }
                if matches!(spec.kind, FilterKind::Bandpass { .. }) {
                    let mut sections = butterworth(omega(low), spec.order, true);
                    sections.extend(butterworth(omega(high), spec.order, false));
                    sections
                } else {
                    let centre = (low * high).sqrt();
                    let q = centre / (high - low);
                    vec![Section::band_reject(omega(centre), q); spec.order.div_ceil(2)]
                }
            }
            FilterKind::Notch { freq, quality } => {
                let quality = positive("quality factor", quality)?;
                let w0 = omega(freq);
                vec![Section::peaking_cut(w0, quality, notch_depth(w0, quality))]
            }
        };

        if let Some(index) = sections.iter().position(|section| !section.is_stable()) {
            return Err(StreamError::UnstableFilter(format!(
                "section {} of {} filter has a pole on or outside the unit circle",
                index,
                spec.kind.short_name()
            )));
        }

        Ok(Self {
            spec: spec.clone(),
            sampling_rate,
            sections,
        })
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Magnitude response of the whole cascade at `freq` Hz.
    pub fn response(&self, freq: f64) -> f64 {
        let omega = 2.0 * PI * freq / self.sampling_rate;
        self.sections
            .iter()
            .map(|section| section.response(omega))
            .fold(Complex64::new(1.0, 0.0), |acc, h| acc * h)
            .norm()
    }

    /// Attenuation at `freq` Hz in dB; positive values mean the signal is reduced.
    pub fn attenuation_db(&self, freq: f64) -> f64 {
        -20.0 * self.response(freq).log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design(spec: FilterSpec) -> FilterDesign {
        spec.with_sampling_rate(250.0).design().unwrap()
    }

    #[test]
    fn butterworth_lowpass_has_unity_dc_and_half_power_cutoff() {
        for order in 1..=6 {
            let filter = design(FilterSpec::lowpass(30.0, order));
            assert!((filter.response(0.0) - 1.0).abs() < 1e-9, "order {}", order);
            assert!(
                (filter.response(30.0) - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9,
                "order {}",
                order
            );
            assert_eq!(filter.sections().len(), order.div_ceil(2));
        }
    }

    #[test]
    fn higher_order_lowpass_rolls_off_faster() {
        let second = design(FilterSpec::lowpass(20.0, 2));
        let sixth = design(FilterSpec::lowpass(20.0, 6));
        assert!(sixth.attenuation_db(60.0) > second.attenuation_db(60.0) + 20.0);
    }

    #[test]
    fn highpass_blocks_dc() {
        let filter = design(FilterSpec::highpass(1.0, 3));
        assert!(filter.response(0.0) < 1e-9);
        assert!((filter.response(100.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn bandpass_passes_centre_and_rejects_edges() {
        let filter = design(FilterSpec::bandpass(8.0, 30.0, 4));
        assert!(filter.response(15.5) > 0.9);
        assert!(filter.response(1.0) < 0.01);
        assert!(filter.response(90.0) < 0.01);
    }

    #[test]
    fn bandstop_rejects_centre() {
        let filter = design(FilterSpec::bandstop(48.0, 52.0, 2));
        assert!(filter.response((48.0f64 * 52.0).sqrt()) < 1e-6);
        assert!((filter.response(10.0) - 1.0).abs() < 0.01);
    }

    #[test]
    fn notch_attenuation_strictly_increases_with_quality() {
        let qualities = [0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 100.0];
        let attenuations: Vec<f64> = qualities
            .iter()
            .map(|&q| design(FilterSpec::notch(50.0, q)).attenuation_db(50.0))
            .collect();
        for pair in attenuations.windows(2) {
            assert!(pair[1] > pair[0], "{:?}", attenuations);
        }
    }

    #[test]
    fn notch_keeps_unity_gain_away_from_target() {
        let filter = design(FilterSpec::notch(50.0, 30.0));
        assert!((filter.response(0.0) - 1.0).abs() < 1e-9);
        assert!((filter.response(125.0) - 1.0).abs() < 1e-9);
        assert!((filter.response(10.0) - 1.0).abs() < 0.01);
    }

    #[test]
    fn notch_depth_matches_design_formula() {
        let filter = design(FilterSpec::notch(50.0, 10.0));
        let omega = 2.0 * PI * 50.0 / 250.0;
        let expected = notch_depth(omega, 10.0);
        assert!((filter.response(50.0) - expected).abs() < 1e-9);
    }

    #[test]
    fn notch_near_nyquist_is_stable() {
        let filter = FilterSpec::notch(49.9, 0.1)
            .with_sampling_rate(100.0)
            .design()
            .unwrap();
        assert!(filter.sections().iter().all(Section::is_stable));
    }

    #[test]
    fn filter_at_or_above_nyquist_is_unstable() {
        for spec in [
            FilterSpec::notch(50.0, 30.0).with_sampling_rate(100.0),
            FilterSpec::notch(60.0, 30.0).with_sampling_rate(100.0),
            FilterSpec::lowpass(50.0, 4).with_sampling_rate(100.0),
            FilterSpec::bandpass(10.0, 60.0, 2).with_sampling_rate(100.0),
        ] {
            assert!(matches!(
                spec.design(),
                Err(StreamError::UnstableFilter(_))
            ));
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            FilterSpec::lowpass(10.0, 0).with_sampling_rate(100.0).design(),
            Err(StreamError::InvalidFilter(_))
        ));
        assert!(matches!(
            FilterSpec::notch(10.0, 0.0).with_sampling_rate(100.0).design(),
            Err(StreamError::InvalidFilter(_))
        ));
        assert!(matches!(
            FilterSpec::bandpass(20.0, 10.0, 2).with_sampling_rate(100.0).design(),
            Err(StreamError::InvalidFilter(_))
        ));
        assert!(matches!(
            FilterSpec::lowpass(10.0, 2).design(),
            Err(StreamError::InvalidFilter(_))
        ));
    }

    #[test]
    fn bind_rejects_mismatched_rate() {
        let spec = FilterSpec::lowpass(10.0, 2).with_sampling_rate(500.0);
        assert!(spec.bind(250.0).is_err());
        let bound = FilterSpec::lowpass(10.0, 2).bind(250.0).unwrap();
        assert_eq!(bound.sampling_rate, Some(250.0));
    }

    #[test]
    fn butterworth_quality_factors() {
        let qs = butterworth_qs(4);
        assert!((qs[0] - 1.306_562_964_876_376_6).abs() < 1e-12);
        assert!((qs[1] - 0.541_196_100_146_197).abs() < 1e-12);
    }
}
