use crate::core::duration::parse_duration;
use crate::core::error::RelayError;

/// Translate the GOP specifier into encoder flags: a frame count becomes
/// `-g N`, a duration becomes a `force_key_frames` expression. Empty means
/// no flags.
pub fn gop_args(gop: &str) -> Result<Vec<String>, RelayError> {
    let gop = gop.trim();
    if gop.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(frames) = gop.parse::<i64>() {
        if frames <= 0 {
            return Err(invalid());
        }
        return Ok(vec!["-g".to_string(), frames.to_string()]);
    }

    if let Ok(duration) = parse_duration(gop) {
        if duration.is_zero() {
            return Err(invalid());
        }
        let seconds = duration.as_secs_f64();
        return Ok(vec![
            "-force_key_frames".to_string(),
            format!("expr:gte(t,n_forced*{seconds:.3})"),
        ]);
    }

    Err(invalid())
}

fn invalid() -> RelayError {
    RelayError::Config("gop must be a positive frame count or duration".into())
}
