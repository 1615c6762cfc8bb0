use goniocompiler_backend::*;

// Prints a per-repeat summary of the waveforms synthesized from a JSON parameter file.
fn main() {
    let params = match std::env::args().nth(1) {
        Some(path) => {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", path, e);
                    std::process::exit(1);
                }
            };
            match serde_json::from_str::<TrialParameters>(&text) {
                Ok(params) => params,
                Err(e) => {
                    eprintln!("Failed to parse {}: {}", path, e);
                    std::process::exit(1);
                }
            }
        }
        None => TrialParameters::default(),
    };

    let plan = match TrialPlan::resolve(&params, LengthPolicy::default()) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    println!("waveform: {}, repeats: {}", plan.waveform(), plan.repeats());
    for i in 0..plan.repeats() {
        match plan.synthesize(i) {
            Ok(waves) => println!(
                "repeat {}: {} samples @ {} Hz, {} frames, stimulus peak {:.3}",
                i,
                waves.len(),
                waves.samp_rate,
                waves.frame_count(params.frame_length),
                waves.stimulus.iter().cloned().fold(f64::MIN, f64::max)
            ),
            Err(e) => eprintln!("repeat {}: {}", i, e),
        }
    }
}
