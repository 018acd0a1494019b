use astro::angle::{deg_frm_dms, deg_frm_hms};

use canonical_error::{CanonicalError, invalid_argument_error};
use serde::{Deserialize, Serialize};

pub const ARCSEC_PER_DEG: f64 = 3600.0;

/// A J2000 sky position. Both fields are in degrees; RA is 0..360, Dec
/// is -90..90.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub ra: f64,
    pub dec: f64,
}

impl Coordinate {
    pub fn new(ra: f64, dec: f64) -> Self {
        Coordinate { ra, dec }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ra {:.4} dec {:.4}", self.ra, self.dec)
    }
}

/// Maps an RA difference into -180..180 degrees, so that a target at
/// 359.9 and a solution at 0.1 yield a small negative delta rather than
/// a full turn.
pub fn normalize_delta_degs(delta: f64) -> f64 {
    let mut d = delta % 360.0;
    if d < -180.0 {
        d += 360.0;
    } else if d >= 180.0 {
        d -= 360.0;
    }
    d
}

/// Returns (delta_ra, delta_dec) in arcseconds to move the boresight from
/// `solved` to `target`. The RA difference is weighted by the cosine of the
/// mean declination, so both components are on-sky angular distances and
/// can be compared against a single tolerance.
pub fn pointing_deltas_arcsec(target: &Coordinate, solved: &Coordinate)
                              -> (f64, f64) {
    let mean_dec = 0.5 * (target.dec + solved.dec);
    let delta_ra = normalize_delta_degs(target.ra - solved.ra)
        * mean_dec.to_radians().cos() * ARCSEC_PER_DEG;
    let delta_dec = (target.dec - solved.dec) * ARCSEC_PER_DEG;
    (delta_ra, delta_dec)
}

/// Returns the on-sky separation between two positions, in arcseconds.
pub fn angular_separation_arcsec(p0: &Coordinate, p1: &Coordinate) -> f64 {
    let p0_ra = p0.ra.to_radians();
    let p0_dec = p0.dec.to_radians();
    let p1_ra = p1.ra.to_radians();
    let p1_dec = p1.dec.to_radians();
    let cos_sep = p0_dec.sin() * p1_dec.sin() +
        p0_dec.cos() * p1_dec.cos() * (p0_ra - p1_ra).cos();
    cos_sep.clamp(-1.0, 1.0).acos().to_degrees() * ARCSEC_PER_DEG
}

/// Parses a right ascension given either as decimal degrees ("183.25") or
/// as sexagesimal hours ("12:13:00"). Returns degrees.
pub fn parse_ra(s: &str) -> Result<f64, CanonicalError> {
    let s = s.trim();
    if let Some((h, m, sec)) = parse_sexagesimal(s)? {
        if h < 0 {
            return Err(invalid_argument_error(
                &format!("RA hours cannot be negative: {}", s)));
        }
        return Ok(deg_frm_hms(h, m, sec));
    }
    s.parse::<f64>().map_err(|_| invalid_argument_error(
        &format!("Cannot parse RA: {}", s)))
}

/// Parses a declination given either as decimal degrees ("-0.5") or as
/// sexagesimal degrees ("-00:30:00"). Returns degrees.
pub fn parse_dec(s: &str) -> Result<f64, CanonicalError> {
    let s = s.trim();
    let (negative, unsigned) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if let Some((d, m, sec)) = parse_sexagesimal(unsigned)? {
        let degs = deg_frm_dms(d, m, sec);
        return Ok(if negative { -degs } else { degs });
    }
    s.parse::<f64>().map_err(|_| invalid_argument_error(
        &format!("Cannot parse Dec: {}", s)))
}

// Returns None if `s` has no ':' (caller falls back to decimal parsing).
fn parse_sexagesimal(s: &str) -> Result<Option<(i64, i64, f64)>, CanonicalError> {
    if !s.contains(':') {
        return Ok(None);
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid_argument_error(
            &format!("Expected h:m:s or d:m:s, got: {}", s)));
    }
    let whole = parts[0].parse::<i64>().map_err(|_| invalid_argument_error(
        &format!("Bad sexagesimal component in: {}", s)))?;
    let minutes = parts[1].parse::<i64>().map_err(|_| invalid_argument_error(
        &format!("Bad sexagesimal component in: {}", s)))?;
    let seconds = parts[2].parse::<f64>().map_err(|_| invalid_argument_error(
        &format!("Bad sexagesimal component in: {}", s)))?;
    Ok(Some((whole, minutes, seconds)))
}

// mod tests.
