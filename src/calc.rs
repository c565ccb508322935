//! Numeric kernels of the attainment pipeline. Nothing in here touches the
//! database; the pipeline modules load rows, call into these functions and
//! persist what comes back.

use serde::Serialize;

/// Two-decimal rounding applied to every stored percentage.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// `obtained / possible * 100`, or 0 when nothing was possible.
pub fn attainment_percentage(obtained: f64, possible: f64) -> f64 {
    if possible > 0.0 {
        obtained / possible * 100.0
    } else {
        0.0
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Closed intervals `[min1, max1]` and `[min2, max2]` intersect.
pub fn ranges_overlap(min1: f64, max1: f64, min2: f64, max2: f64) -> bool {
    min1 <= max2 && min2 <= max1
}

/// A `[min_percentage, max_percentage]` band: threshold levels and grade points.
pub trait PercentBand {
    fn min_percentage(&self) -> f64;
    fn max_percentage(&self) -> f64;
}

/// Widest gap between neighbouring bands that still resolves to the band below.
pub const MAX_BAND_GAP: f64 = 1.0;

/// Finds the band containing `percentage`.
///
/// Bands are authored on whole numbers (`[0,59]`, `[60,100]`), which leaves
/// open gaps such as `(59, 60)`. A percentage strictly inside a gap no wider
/// than [`MAX_BAND_GAP`] resolves to the band directly below it. Wider gaps,
/// and anything below the lowest band or above the highest one, have no band.
pub fn resolve_band<B: PercentBand>(bands: &[B], percentage: f64) -> Option<&B> {
    if let Some(b) = bands
        .iter()
        .find(|b| b.min_percentage() <= percentage && percentage <= b.max_percentage())
    {
        return Some(b);
    }
    let above = bands
        .iter()
        .filter(|b| b.min_percentage() > percentage)
        .map(|b| b.min_percentage())
        .min_by(|a, b| a.total_cmp(b))?;
    let below = bands
        .iter()
        .filter(|b| b.max_percentage() < percentage)
        .max_by(|a, b| a.max_percentage().total_cmp(&b.max_percentage()))?;
    (above - below.max_percentage() <= MAX_BAND_GAP).then_some(below)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentMark {
    Exempted,
    /// Absent, or no marks entered yet.
    Missing,
    Graded(f64),
}

impl ComponentMark {
    /// Exemption wins over absence; absence wins over a stale mark.
    pub fn from_row(marks_obtained: Option<f64>, is_absent: bool, is_exempted: bool) -> Self {
        if is_exempted {
            return ComponentMark::Exempted;
        }
        if is_absent {
            return ComponentMark::Missing;
        }
        match marks_obtained {
            Some(v) => ComponentMark::Graded(v),
            None => ComponentMark::Missing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentScore {
    pub weightage: f64,
    pub max_marks: f64,
    pub mark: ComponentMark,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeightedPercentage {
    pub weighted_marks: f64,
    pub weightage_sum: f64,
    pub percentage: f64,
    pub graded_count: usize,
    pub missing_count: usize,
    pub exempted_count: usize,
}

impl WeightedPercentage {
    pub fn has_incomplete(&self) -> bool {
        self.missing_count > 0
    }
}

/// Weighted course percentage renormalised against the graded components.
///
/// Exempted components are left out of numerator and denominator. Missing
/// ones are counted (they taint the status) but contribute nothing.
pub fn weighted_percentage<I>(components: I) -> WeightedPercentage
where
    I: IntoIterator<Item = ComponentScore>,
{
    let mut out = WeightedPercentage::default();
    for c in components {
        match c.mark {
            ComponentMark::Exempted => out.exempted_count += 1,
            ComponentMark::Missing => out.missing_count += 1,
            ComponentMark::Graded(v) => {
                out.graded_count += 1;
                if c.max_marks <= 0.0 {
                    continue;
                }
                out.weighted_marks += (v / c.max_marks) * c.weightage;
                out.weightage_sum += c.weightage;
            }
        }
    }
    out.percentage = if out.weightage_sum > 0.0 {
        out.weighted_marks / out.weightage_sum * 100.0
    } else {
        0.0
    };
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultStatus {
    Pass,
    Fail,
    Incomplete,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Pass => "Pass",
            ResultStatus::Fail => "Fail",
            ResultStatus::Incomplete => "Incomplete",
        }
    }

    /// Incompleteness dominates any grade derived from partial data. Without
    /// a grade point the result cannot pass.
    pub fn decide(grade_point: Option<f64>, has_incomplete: bool) -> Self {
        if has_incomplete {
            return ResultStatus::Incomplete;
        }
        match grade_point {
            Some(gp) if gp > 0.0 => ResultStatus::Pass,
            _ => ResultStatus::Fail,
        }
    }
}

pub fn credit_earned(grade_point: Option<f64>, credit_hours: f64) -> f64 {
    match grade_point {
        Some(gp) if gp > 0.0 => credit_hours,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttainmentStatus {
    #[serde(rename = "Achieved")]
    Achieved,
    #[serde(rename = "Not Achieved")]
    NotAchieved,
}

impl AttainmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttainmentStatus::Achieved => "Achieved",
            AttainmentStatus::NotAchieved => "Not Achieved",
        }
    }

    /// Marks-based status: nothing possible means nothing achieved.
    pub fn from_marks(percentage: f64, total_possible: f64, target: f64) -> Self {
        if total_possible > 0.0 && percentage >= target {
            AttainmentStatus::Achieved
        } else {
            AttainmentStatus::NotAchieved
        }
    }

    pub fn from_percentage(percentage: f64, target: f64) -> Self {
        if percentage >= target {
            AttainmentStatus::Achieved
        } else {
            AttainmentStatus::NotAchieved
        }
    }
}

pub const DEFAULT_NEAR_TARGET_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum OverallStatus {
    #[serde(rename = "Below Target")]
    BelowTarget,
    #[serde(rename = "Near Target")]
    NearTarget,
    #[serde(rename = "Target Met")]
    TargetMet,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::BelowTarget => "Below Target",
            OverallStatus::NearTarget => "Near Target",
            OverallStatus::TargetMet => "Target Met",
        }
    }

    pub fn classify(average: f64, target: f64, near_target_ratio: f64) -> Self {
        if average >= target {
            OverallStatus::TargetMet
        } else if average >= near_target_ratio * target {
            OverallStatus::NearTarget
        } else {
            OverallStatus::BelowTarget
        }
    }
}

/// Descriptive statistics over a set of attainment percentages.
/// `std_dev` is the population standard deviation (divide by `n`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Descriptive {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

pub fn describe(values: &[f64]) -> Option<Descriptive> {
    let mean = mean(values)?;
    let n = values.len() as f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sq = 0.0_f64;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
        sq += (v - mean) * (v - mean);
    }
    Some(Descriptive {
        count: values.len(),
        mean,
        min,
        max,
        std_dev: (sq / n).sqrt(),
    })
}

/// Rate of `part` in `whole` as a percentage; 0 when `whole` is 0.
pub fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Fixed buckets, highest first. A value belongs to the first bucket whose
/// floor it reaches.
pub const DISTRIBUTION_BUCKETS: [(&str, f64); 6] = [
    ("90-100", 90.0),
    ("80-89", 80.0),
    ("70-79", 70.0),
    ("60-69", 60.0),
    ("50-59", 50.0),
    ("<50", f64::NEG_INFINITY),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketShare {
    pub range: &'static str,
    pub count: usize,
    pub percentage: f64,
}

pub fn distribution(values: &[f64]) -> Vec<BucketShare> {
    let mut counts = [0_usize; DISTRIBUTION_BUCKETS.len()];
    for &v in values {
        if let Some(i) = DISTRIBUTION_BUCKETS.iter().position(|(_, floor)| v >= *floor) {
            counts[i] += 1;
        }
    }
    DISTRIBUTION_BUCKETS
        .iter()
        .zip(counts)
        .map(|(&(range, _), count)| BucketShare {
            range,
            count,
            percentage: round2(rate(count, values.len())),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    Rating,
    Likert,
    YesNo,
    Other,
}

impl QuestionType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "rating" => QuestionType::Rating,
            "likert" => QuestionType::Likert,
            "yes_no" => QuestionType::YesNo,
            _ => QuestionType::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::Rating => "rating",
            QuestionType::Likert => "likert",
            QuestionType::YesNo => "yes_no",
            QuestionType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuestionScale {
    pub max_value: f64,
    pub scale_size: f64,
}

fn is_affirmative(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "true" | "1"
    )
}

/// Maps one survey answer onto 0..=100. `None` means the answer carries no
/// numeric signal (blank, unparseable, degenerate scale, or an unscored type).
pub fn normalize_answer(question_type: QuestionType, raw: &str, scale: QuestionScale) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let normalized = match question_type {
        QuestionType::Rating => {
            if scale.max_value <= 0.0 {
                return None;
            }
            raw.parse::<f64>().ok()? / scale.max_value * 100.0
        }
        QuestionType::Likert => {
            if scale.scale_size <= 1.0 {
                return None;
            }
            (raw.parse::<f64>().ok()? - 1.0) / (scale.scale_size - 1.0) * 100.0
        }
        QuestionType::YesNo => {
            if is_affirmative(raw) {
                100.0
            } else {
                0.0
            }
        }
        QuestionType::Other => return None,
    };
    if !normalized.is_finite() {
        return None;
    }
    Some(normalized.clamp(0.0, 100.0))
}
