// Sample-grid helpers shared by the synthesizer and the parameter checks.

/// Number of samples covering `duration` seconds at `samp_rate`, rounded to the nearest tick.
pub fn samples_for(duration: f64, samp_rate: f64) -> usize {
    let samps = (duration * samp_rate).round();
    if samps <= 0. {
        0
    } else {
        samps as usize
    }
}

/// Whole frames of `frame_length` that fit into `duration`.
///
/// A small tolerance absorbs binary representation error so that e.g. `2.5 / 0.1` counts 25
/// frames rather than 24.
pub fn whole_frames(duration: f64, frame_length: f64) -> usize {
    let frames = (duration / frame_length + 1e-9).floor();
    if frames <= 0. {
        0
    } else {
        frames as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sample_rounding() {
        assert_eq!(samples_for(2.5, 1000.), 2500);
        assert_eq!(samples_for(0.0004, 1000.), 0);
        assert_eq!(samples_for(0.0006, 1000.), 1);
        assert_eq!(samples_for(-1., 1000.), 0);
    }

    #[test]
    fn frame_counting() {
        assert_eq!(whole_frames(2.5, 0.1), 25);
        assert_eq!(whole_frames(0.3, 0.1), 3);
        assert_eq!(whole_frames(0.25, 0.1), 2);
    }
}
