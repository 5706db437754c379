#![no_main]

use libfuzzer_sys::fuzz_target;
use qforge_opt::SignClass;
use qforge_opt::calibrate::{DEFAULT_NUM_BINS, calibrate_kl, calibrate_minmax};

fuzz_target!(|data: &[u8]| {
    let values: Vec<f32> = data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let sign = SignClass::Signed.for_data(&values);
    // Calibration either yields a positive finite scale or a typed error.
    for result in [
        calibrate_minmax(&values, sign),
        calibrate_kl(&values, sign, DEFAULT_NUM_BINS),
    ] {
        if let Ok(scale) = result {
            assert!(scale > 0.0, "non-positive scale {scale}");
        }
    }
});
