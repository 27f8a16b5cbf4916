use anyhow::{Context, Result};

use rusty_dose::data::model::METADATA_COLUMNS;
use rusty_dose::fit::FourPl;

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

const REPLICATES: usize = 3;

fn main() -> Result<()> {
    let output_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "sample_doses.tsv".to_string());
    let mut rng = SimpleRng::new(42);

    // Nanomolar, 10 nM → 10 µM
    let concentrations: [f64; 7] = [10.0, 30.0, 100.0, 300.0, 1000.0, 3000.0, 10000.0];
    let cell_lines = ["MOLM13", "MV4-11"];

    // (drug, slope, bottom, top, log10 IC50 in molar)
    let drugs: [(&str, f64, f64, f64, f64); 3] = [
        ("Sorafenib", 1.2, 2.0, 95.0, -7.0),
        ("AC220", 2.0, 5.0, 98.0, -7.8),
        ("Cytarabine", 0.8, 0.0, 60.0, -5.5),
    ];

    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&output_path)
        .with_context(|| format!("Failed to create {output_path}"))?;

    let mut header: Vec<String> = METADATA_COLUMNS.iter().map(|s| s.to_string()).collect();
    header.extend((1..=REPLICATES).map(|r| format!("Response_Rep{r}")));
    wtr.write_record(&header)?;

    let mut rows = 0;
    for experiment in 1..=2 {
        for (line_idx, line) in cell_lines.iter().enumerate() {
            for &(drug, slope, bottom, top, log10_ic50) in &drugs {
                // Second cell line is a little less sensitive.
                let curve = FourPl {
                    slope,
                    bottom,
                    top,
                    log10_ic50: log10_ic50 + 0.3 * line_idx as f64,
                };
                for &conc in &concentrations {
                    let inhibition = curve.eval((conc * 1e-9).log10());
                    let mut record = vec![
                        experiment.to_string(),
                        line.to_string(),
                        drug.to_string(),
                        conc.to_string(),
                    ];
                    for _ in 0..REPLICATES {
                        let viability = (100.0 - inhibition + rng.gauss(0.0, 3.0)).max(0.0);
                        record.push(format!("{viability:.2}"));
                    }
                    wtr.write_record(&record)?;
                    rows += 1;
                }
            }
        }
    }
    wtr.flush()?;

    println!(
        "Wrote {rows} rows ({} replicates each, viability %, nanomolar) to {output_path}",
        REPLICATES
    );
    Ok(())
}
