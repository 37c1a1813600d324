// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Media format constraints ("caps") and the video format parser used for
//! the --video-caps flag.

use anyhow::{anyhow, bail};
use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub const ZERO: Fraction = Fraction::new(0, 1);

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    fn cmp_value(&self, other: &Fraction) -> std::cmp::Ordering {
        let a = self.num as i64 * other.den as i64;
        let b = other.num as i64 * self.den as i64;
        a.cmp(&b)
    }

    pub fn reduced(self) -> Self {
        fn gcd(a: i32, b: i32) -> i32 {
            if b == 0 {
                a.abs().max(1)
            } else {
                gcd(b, a % b)
            }
        }
        let g = gcd(self.num, self.den);
        Fraction::new(self.num / g, self.den / g)
    }

    /// Best rational approximation via continued fractions, denominator
    /// capped at one million.
    pub fn approximate(v: f64) -> Self {
        if v <= 0.0 {
            return Fraction::ZERO;
        }
        if v.fract() == 0.0 {
            return Fraction::new(v as i32, 1);
        }

        let (mut p0, mut q0, mut p1, mut q1) = (0i64, 1i64, 1i64, 0i64);
        let mut x = v;
        loop {
            let a = x.floor() as i64;
            let p2 = a * p1 + p0;
            let q2 = a * q1 + q0;
            if q2 > 1_000_000 {
                break;
            }
            p0 = p1;
            q0 = q1;
            p1 = p2;
            q1 = q2;

            let frac = x - a as f64;
            if frac.abs() < 1e-9 {
                break;
            }
            x = 1.0 / frac;
        }

        Fraction::new(p1 as i32, q1 as i32).reduced()
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapsValue {
    Int(i32),
    IntRange(i32, i32),
    Fraction(Fraction),
    FractionRange(Fraction, Fraction),
    Str(String),
}

impl CapsValue {
    fn is_fixed(&self) -> bool {
        !matches!(self, CapsValue::IntRange(..) | CapsValue::FractionRange(..))
    }

    fn intersect(&self, other: &CapsValue) -> Option<CapsValue> {
        use CapsValue::*;
        match (self, other) {
            (Int(a), Int(b)) if a == b => Some(Int(*a)),
            (Int(v), IntRange(lo, hi)) | (IntRange(lo, hi), Int(v)) if lo <= v && v <= hi => {
                Some(Int(*v))
            }
            (IntRange(a, b), IntRange(c, d)) => {
                let lo = *a.max(c);
                let hi = *b.min(d);
                if lo > hi {
                    None
                } else if lo == hi {
                    Some(Int(lo))
                } else {
                    Some(IntRange(lo, hi))
                }
            }
            (Fraction(a), Fraction(b)) if a.cmp_value(b).is_eq() => Some(Fraction(*a)),
            (Fraction(v), FractionRange(lo, hi)) | (FractionRange(lo, hi), Fraction(v))
                if lo.cmp_value(v).is_le() && v.cmp_value(hi).is_le() =>
            {
                Some(Fraction(*v))
            }
            (FractionRange(a, b), FractionRange(c, d)) => {
                let lo = if a.cmp_value(c).is_ge() { *a } else { *c };
                let hi = if b.cmp_value(d).is_le() { *b } else { *d };
                if lo.cmp_value(&hi).is_gt() {
                    None
                } else {
                    Some(FractionRange(lo, hi))
                }
            }
            (Str(a), Str(b)) if a == b => Some(Str(a.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapsValue::Int(v) => write!(f, "{}", v),
            CapsValue::IntRange(lo, hi) => write!(f, "[{},{}]", lo, hi),
            CapsValue::Fraction(v) => write!(f, "{}", v),
            CapsValue::FractionRange(lo, hi) => write!(f, "[{},{}]", lo, hi),
            CapsValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// A set of media format constraints: a media type plus ordered fields.
/// Fully-specified caps (no ranges) describe a concrete stream format.
#[derive(Debug, Clone, PartialEq)]
pub struct Caps {
    pub media: String,
    fields: Vec<(String, CapsValue)>,
}

impl Caps {
    pub fn new(media: &str) -> Self {
        Self {
            media: media.to_owned(),
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: CapsValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: CapsValue) {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name.to_owned(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&CapsValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.get(name) {
            Some(CapsValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_fraction(&self, name: &str) -> Option<Fraction> {
        match self.get(name) {
            Some(CapsValue::Fraction(v)) => Some(*v),
            Some(CapsValue::Int(v)) => Some(Fraction::new(*v, 1)),
            _ => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fields.iter().all(|(_, v)| v.is_fixed())
    }

    /// Intersection of two caps. `None` means the caps are incompatible
    /// (the empty set).
    pub fn intersect(&self, other: &Caps) -> Option<Caps> {
        if self.media != other.media {
            return None;
        }

        let mut out = Caps::new(&self.media);
        for (name, value) in &self.fields {
            match other.get(name) {
                Some(theirs) => out.set(name, value.intersect(theirs)?),
                None => out.set(name, value.clone()),
            }
        }
        for (name, value) in &other.fields {
            if out.get(name).is_none() {
                out.set(name, value.clone());
            }
        }

        Some(out)
    }

    /// Parses the textual caps form, e.g.
    /// `video/x-raw,height=400,width=500,framerate=25/1`. Range values use
    /// brackets: `height=[400,800]`. A `(type)` annotation before a value
    /// is accepted and ignored.
    pub fn parse(s: &str) -> anyhow::Result<Caps> {
        let mut parts = split_caps_fields(s);
        if parts.is_empty() {
            bail!("empty caps string");
        }

        let media = parts.remove(0);
        if media.is_empty() || media.contains('=') || !media.contains('/') {
            bail!("invalid caps media type: {:?}", media);
        }

        let mut caps = Caps::new(media.trim());
        for part in parts {
            let (name, raw) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid caps field: {:?}", part))?;
            caps.set(name.trim(), parse_caps_value(raw.trim())?);
        }

        Ok(caps)
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.media)?;
        for (name, value) in &self.fields {
            write!(f, ",{}={}", name, value)?;
        }
        Ok(())
    }
}

/// Splits caps fields on commas, but not inside range brackets.
fn split_caps_fields(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '[' => {
                depth += 1;
                cur.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn parse_caps_value(raw: &str) -> anyhow::Result<CapsValue> {
    // Strip an optional "(type)" annotation.
    let raw = if let Some(rest) = raw.strip_prefix('(') {
        match rest.split_once(')') {
            Some((_, value)) => value,
            None => bail!("unterminated type annotation in {:?}", raw),
        }
    } else {
        raw
    };

    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let (lo, hi) = inner
            .split_once(',')
            .ok_or_else(|| anyhow!("invalid range: {:?}", raw))?;
        let lo = lo.trim();
        let hi = hi.trim();
        if lo.contains('/') || hi.contains('/') {
            return Ok(CapsValue::FractionRange(
                parse_fraction(lo)?,
                parse_fraction(hi)?,
            ));
        }
        return Ok(CapsValue::IntRange(lo.parse()?, hi.parse()?));
    }

    if raw.contains('/') {
        if let Ok(frac) = parse_fraction(raw) {
            return Ok(CapsValue::Fraction(frac));
        }
    }
    if let Ok(v) = raw.parse::<i32>() {
        return Ok(CapsValue::Int(v));
    }

    Ok(CapsValue::Str(raw.to_owned()))
}

fn parse_fraction(s: &str) -> anyhow::Result<Fraction> {
    let (num, den) = s
        .split_once('/')
        .ok_or_else(|| anyhow!("invalid fraction: {:?}", s))?;
    let den: i32 = den.trim().parse()?;
    if den == 0 {
        bail!("zero denominator in fraction: {:?}", s);
    }
    Ok(Fraction::new(num.trim().parse()?, den))
}

/// Parsed video stream parameters. A zeroed info means "no caps yet".
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub fps: Fraction,
    pub par: Fraction,
}

impl VideoInfo {
    pub fn zeroed() -> Self {
        Self {
            format: String::new(),
            width: 0,
            height: 0,
            fps: Fraction::ZERO,
            par: Fraction::ZERO,
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    pub fn from_caps(caps: &Caps) -> Option<Self> {
        if !caps.media.starts_with("video/") && !caps.media.starts_with("image/") {
            return None;
        }

        Some(Self {
            format: match caps.get("format") {
                Some(CapsValue::Str(s)) => s.clone(),
                _ => "I420".to_owned(),
            },
            width: u32::try_from(caps.get_int("width")?).ok()?,
            height: u32::try_from(caps.get_int("height")?).ok()?,
            fps: caps.get_fraction("framerate").unwrap_or(Fraction::new(25, 1)),
            par: caps
                .get_fraction("pixel-aspect-ratio")
                .unwrap_or(Fraction::new(1, 1)),
        })
    }
}

impl Default for VideoInfo {
    fn default() -> Self {
        Self::zeroed()
    }
}

// Resolution shortcuts accepted by the short WxH@R form. Matching is
// case-insensitive and picks the longest shortcut that prefixes the input,
// so pal-16:9 resolves to its own entry rather than pal's.
//
// The analog TV entries are deinterlaced DV frame sizes converted to square
// pixels, which is why they look odd. NTSC resolves to the 16:9 variant.
const FORMAT_ALIASES: &[(&str, &str)] = &[
    ("debug", "300x200@25"),
    // Computer resolutions carry no default rate; VGA@60 etc.
    ("VGA", "640x480"),
    ("SVGA", "800x600"),
    ("XGA", "1024x768"),
    ("pal", "788x576@25"),
    ("pal-4:3", "788x576@25"),
    ("pal-dv", "788x576@25"),
    ("pal-16:9", "1050x576@25"),
    ("pal-dvd", "1050x576@25"),
    ("ntsc-4:3", "720x534@25"),
    ("ntsc-dv", "720x534@25"),
    ("ntsc", "864x480@25"),
    ("ntsc-16:9", "864x480@25"),
    ("ntsc-dvd", "864x480@25"),
    // Digital TV resolutions spell the rate after a 'p', e.g. 720p60.
    ("720p", "1280x720@"),
    ("1080p", "1920x1080@"),
    ("2160p", "4096x2160@"),
    ("4320p", "7680x4320@"),
    ("2k", "2048x1080"),
    ("4k", "4096x2160"),
    ("8k", "7680x4320"),
];

lazy_static! {
    static ref SHORT_FORMAT_RE: Regex =
        Regex::new(r"^(\d+)x(\d+)@(\d+(?:\.\d+)?)(?:/(\d+))?$").unwrap();
}

/// The constraints every accepted video format must satisfy: planar I420
/// with square pixels, at least 300x200 (the PIP floor), at most 8k, and a
/// sane framerate.
fn requirement_caps() -> Caps {
    Caps::new("video/x-raw")
        .with("format", CapsValue::Str("I420".into()))
        .with(
            "pixel-aspect-ratio",
            CapsValue::Fraction(Fraction::new(1, 1)),
        )
        .with("width", CapsValue::IntRange(300, 7680))
        .with("height", CapsValue::IntRange(200, 4320))
        .with(
            "framerate",
            CapsValue::FractionRange(Fraction::new(0, 1), Fraction::new(1000, 1)),
        )
}

fn parse_short_format(format: &str, caps: &mut Caps) -> anyhow::Result<()> {
    let lower = format.to_ascii_lowercase();

    let mut expanded = format.to_owned();
    let mut best: Option<&(&str, &str)> = None;
    for alias in FORMAT_ALIASES {
        if lower.starts_with(&alias.0.to_ascii_lowercase())
            && best.map(|b| alias.0.len() > b.0.len()).unwrap_or(true)
        {
            best = Some(alias);
        }
    }
    if let Some((shortcut, expansion)) = best {
        expanded = format!("{}{}", expansion, &format[shortcut.len()..]);
    }

    let captures = SHORT_FORMAT_RE
        .captures(&expanded)
        .ok_or_else(|| anyhow!("unrecognized format: {:?}", format))?;

    let width: i32 = captures[1].parse()?;
    let height: i32 = captures[2].parse()?;
    let rate: f64 = captures[3].parse()?;

    let framerate = match captures.get(4) {
        Some(den) => {
            // An explicit denominator requires an integer numerator.
            if rate.fract() != 0.0 {
                bail!("fractional numerator in framerate: {:?}", format);
            }
            Fraction::new(rate as i32, den.as_str().parse()?).reduced()
        }
        None => Fraction::approximate(rate),
    };

    caps.set("width", CapsValue::Int(width));
    caps.set("height", CapsValue::Int(height));
    caps.set("framerate", CapsValue::Fraction(framerate));

    Ok(())
}

/// Resolves a video format argument to fully specified caps.
///
/// Accepts either full textual caps (which must be fixed), or the short
/// `WxH@R` form, optionally via one of the resolution shortcuts above.
pub fn parse_format(format: &str) -> anyhow::Result<Caps> {
    let mut incoming = Caps::new("video/x-raw")
        .with("format", CapsValue::Str("I420".into()))
        .with(
            "pixel-aspect-ratio",
            CapsValue::Fraction(Fraction::new(1, 1)),
        );

    if format.contains("video/x-raw") {
        let parsed = Caps::parse(format)?;
        if !parsed.is_fixed() {
            bail!("video format is not fully specified: {:?}", format);
        }

        incoming = incoming
            .intersect(&parsed)
            .ok_or_else(|| anyhow!("invalid video format: {:?}", format))?;
    } else {
        parse_short_format(format, &mut incoming)?;
    }

    let merged = requirement_caps()
        .intersect(&incoming)
        .ok_or_else(|| anyhow!("invalid video format: {:?}", format))?;
    if !merged.is_fixed() {
        bail!("video format is not fully specified: {:?}", format);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dims(caps: &Caps) -> (i32, i32, Fraction) {
        (
            caps.get_int("width").unwrap(),
            caps.get_int("height").unwrap(),
            caps.get_fraction("framerate").unwrap(),
        )
    }

    #[test]
    fn test_parse_format_shortcuts() {
        let caps = parse_format("debug").unwrap();
        assert_eq!(dims(&caps), (300, 200, Fraction::new(25, 1)));
        assert_eq!(caps.get("format"), Some(&CapsValue::Str("I420".into())));

        let caps = parse_format("pal").unwrap();
        assert_eq!(dims(&caps), (788, 576, Fraction::new(25, 1)));

        let caps = parse_format("720p60").unwrap();
        assert_eq!(dims(&caps), (1280, 720, Fraction::new(60, 1)));

        let caps = parse_format("VGA@60").unwrap();
        assert_eq!(dims(&caps), (640, 480, Fraction::new(60, 1)));

        let caps = parse_format("4k@60").unwrap();
        assert_eq!(dims(&caps), (4096, 2160, Fraction::new(60, 1)));
    }

    #[test]
    fn test_parse_format_explicit() {
        let caps = parse_format("1024x768@60").unwrap();
        assert_eq!(dims(&caps), (1024, 768, Fraction::new(60, 1)));

        let caps = parse_format("video/x-raw,height=400,width=500,framerate=25/1").unwrap();
        assert_eq!(dims(&caps), (500, 400, Fraction::new(25, 1)));
    }

    #[test]
    fn test_parse_format_fractional_rate() {
        let caps = parse_format("640x480@29.97").unwrap();
        let fps = caps.get_fraction("framerate").unwrap();
        assert!((fps.as_f64() - 29.97).abs() < 1e-6);

        let caps = parse_format("640x480@30000/1001").unwrap();
        assert_eq!(
            caps.get_fraction("framerate").unwrap(),
            Fraction::new(30000, 1001)
        );
    }

    #[test]
    fn test_parse_format_rejects() {
        // Ranges are not fully specified.
        assert!(parse_format("video/x-raw,height=[400,800],width=500,framerate=25/1").is_err());
        // The rate goes after the 'p', not behind a second '@'.
        assert!(parse_format("720p@75").is_err());
        assert!(parse_format("bad-format-string").is_err());
        // Out of bounds.
        assert!(parse_format("video/x-raw,height=10,width=500,framerate=25/1").is_err());
        assert!(parse_format("video/x-raw,height=400,width=10,framerate=25/1").is_err());
        assert!(parse_format("video/x-raw,height=400,width=500,framerate=1001/1").is_err());
        // Computer resolutions have no default rate.
        assert!(parse_format("VGA").is_err());
    }

    #[test]
    fn test_parse_format_idempotent() {
        for s in ["debug", "pal", "720p60", "1024x768@60", "4k@60"] {
            let caps = parse_format(s).unwrap();
            let reparsed = parse_format(&caps.to_string()).unwrap();
            assert_eq!(caps, reparsed);
        }
    }

    #[test]
    fn test_longest_alias_wins() {
        let caps = parse_format("pal-16:9").unwrap();
        assert_eq!(dims(&caps), (1050, 576, Fraction::new(25, 1)));

        let caps = parse_format("ntsc").unwrap();
        assert_eq!(dims(&caps), (864, 480, Fraction::new(25, 1)));

        let caps = parse_format("ntsc-4:3").unwrap();
        assert_eq!(dims(&caps), (720, 534, Fraction::new(25, 1)));
    }

    #[test]
    fn test_caps_intersect() {
        let a = Caps::new("video/x-raw").with("width", CapsValue::IntRange(300, 7680));
        let b = Caps::new("video/x-raw").with("width", CapsValue::Int(1280));
        assert_eq!(
            a.intersect(&b).unwrap().get_int("width"),
            Some(1280),
        );

        let c = Caps::new("video/x-raw").with("width", CapsValue::Int(8000));
        assert!(a.intersect(&c).is_none());

        let d = Caps::new("audio/x-raw");
        assert!(a.intersect(&d).is_none());
    }

    #[test]
    fn test_video_info_from_caps() {
        let caps = parse_format("debug").unwrap();
        let info = VideoInfo::from_caps(&caps).unwrap();
        assert_eq!(info.width, 300);
        assert_eq!(info.height, 200);
        assert_eq!(info.fps, Fraction::new(25, 1));
        assert_eq!(info.par, Fraction::new(1, 1));
    }
}
