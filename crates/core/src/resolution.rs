//! Preview size negotiation.
//!
//! The capture worker asks for a target size derived from a
//! [`VideoQuality`] profile and then picks the closest size the camera
//! actually supports with [`select_preview_size`].

use crate::frame::Size;

/// Maximum difference between two `height / width` ratios for them to be
/// considered the same aspect ratio.
pub const ASPECT_TOLERANCE: f64 = 0.1;

/// Pick the supported size closest to `target`.
///
/// 1. An exact match wins immediately.
/// 2. Otherwise, among sizes whose aspect ratio is within
///    [`ASPECT_TOLERANCE`] of the target's, the one with the closest height.
/// 3. Otherwise, the size with the closest height regardless of ratio.
///
/// Ties are broken by closest width, then smaller width, so the result does
/// not depend on the order of `supported`. Returns `None` only when
/// `supported` is empty.
///
/// ```
/// use rtsplive::frame::Size;
/// use rtsplive::resolution::select_preview_size;
///
/// let supported = [Size::new(800, 450), Size::new(1024, 576)];
/// let picked = select_preview_size(&supported, Size::new(640, 480));
/// assert_eq!(picked, Some(Size::new(800, 450)));
/// ```
pub fn select_preview_size(supported: &[Size], target: Size) -> Option<Size> {
    if let Some(exact) = supported.iter().find(|s| **s == target) {
        return Some(*exact);
    }

    let target_ratio = ratio(target);
    let same_ratio = closest(
        supported
            .iter()
            .filter(|s| (ratio(**s) - target_ratio).abs() < ASPECT_TOLERANCE),
        target,
    );

    same_ratio.or_else(|| closest(supported.iter(), target))
}

fn closest<'a>(candidates: impl Iterator<Item = &'a Size>, target: Size) -> Option<Size> {
    candidates
        .min_by_key(|s| {
            (
                s.height.abs_diff(target.height),
                s.width.abs_diff(target.width),
                s.width,
            )
        })
        .copied()
}

fn ratio(size: Size) -> f64 {
    if size.width == 0 {
        return f64::INFINITY;
    }
    f64::from(size.height) / f64::from(size.width)
}

/// Recording quality profiles a camera may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoQuality {
    /// Lowest profile the device offers.
    Low,
    /// Highest profile the device offers.
    High,
    Qvga,
    P480,
    P720,
    P1080,
    P2160,
}

impl VideoQuality {
    /// Profiles with fixed dimensions, smallest first.
    pub const CONCRETE: [VideoQuality; 5] = [
        VideoQuality::Qvga,
        VideoQuality::P480,
        VideoQuality::P720,
        VideoQuality::P1080,
        VideoQuality::P2160,
    ];

    /// Frame size of a concrete profile. `Low` and `High` depend on the
    /// device and return `None`.
    pub fn dimensions(self) -> Option<Size> {
        match self {
            Self::Qvga => Some(Size::new(320, 240)),
            Self::P480 => Some(Size::new(640, 480)),
            Self::P720 => Some(Size::new(1280, 720)),
            Self::P1080 => Some(Size::new(1920, 1080)),
            Self::P2160 => Some(Size::new(3840, 2160)),
            Self::Low | Self::High => None,
        }
    }

    /// The profile to try when this one is not available.
    pub fn fallback(self) -> Option<VideoQuality> {
        match self {
            Self::P2160 => Some(Self::High),
            Self::P1080 => Some(Self::P720),
            Self::P720 => Some(Self::P480),
            Self::P480 => Some(Self::Qvga),
            Self::Qvga => Some(Self::Low),
            Self::Low | Self::High => None,
        }
    }
}

/// Size used for `Low` when the device advertises no concrete profile.
const LOWEST_SIZE: Size = Size::new(176, 144);

/// Resolve `quality` to a target capture size, walking the fallback chain
/// until `has_profile` accepts a profile.
///
/// `High` and `Low` always resolve: to the largest/smallest concrete profile
/// the device has, or to a QCIF-sized frame when it has none.
pub fn resolve_quality(quality: VideoQuality, has_profile: impl Fn(VideoQuality) -> bool) -> Size {
    let mut current = quality;
    loop {
        match current {
            VideoQuality::High => {
                return VideoQuality::CONCRETE
                    .iter()
                    .rev()
                    .find(|q| has_profile(**q))
                    .and_then(|q| q.dimensions())
                    .unwrap_or(LOWEST_SIZE);
            }
            VideoQuality::Low => {
                return VideoQuality::CONCRETE
                    .iter()
                    .find(|q| has_profile(**q))
                    .and_then(|q| q.dimensions())
                    .unwrap_or(LOWEST_SIZE);
            }
            concrete => {
                if has_profile(concrete) {
                    if let Some(size) = concrete.dimensions() {
                        return size;
                    }
                }
                match concrete.fallback() {
                    Some(next) => current = next,
                    None => return LOWEST_SIZE,
                }
            }
        }
    }
}
