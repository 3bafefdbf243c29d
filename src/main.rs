use std::io;
use std::time::Instant;

use xpsfit::arrayops::gridspace;
use xpsfit::prelude::*;
use xpsfit::shapes::PseudoVoigtShape;

fn synthetic_region() -> io::Result<Region> {
    let energy = gridspace(280.0, 292.0, 0.05);
    let background: Vec<f64> = energy.iter().map(|e| 150.0 + 1.5 * (e - 280.0)).collect();
    let components = [
        PseudoVoigtShape::new(6000.0, 284.8, 0.55, 0.5),
        PseudoVoigtShape::new(1800.0, 286.3, 0.6, 0.5),
        PseudoVoigtShape::new(900.0, 288.9, 0.65, 0.5),
    ];
    let cps = energy
        .iter()
        .zip(background.iter())
        .enumerate()
        .map(|(i, (e, b))| {
            b + components.iter().map(|c| c.density(*e)).sum::<f64>()
                + 5.0 * (i as f64 * 1.3).sin()
        })
        .collect();
    Region::new(1, energy, cps)
        .and_then(|r| r.with_background(background))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn main() -> io::Result<()> {
    let mut region = synthetic_region()?;
    let ids: Vec<_> = (0..3)
        .map(|_| region.add_peak(PeakShapeKind::PseudoVoigt))
        .collect();

    let mut model = RegionFitModel::for_region(&region);
    let starts = [(5000.0, 1.4, 285.0), (1500.0, 1.4, 286.0), (1000.0, 1.4, 289.0)];
    for (id, (area, fwhm, center)) in ids.iter().zip(starts) {
        if let Some(peak) = region.peak(*id) {
            if let Err(err) = model.init_params(peak, PeakValues::new(area, fwhm, center)) {
                println!("Encountered error {:?}", err);
            }
        }
    }

    // Tie the second peak's width to the first one
    if let (Some(first), Some(second)) = (region.peak(ids[0]), region.peak(ids[1])) {
        let expr = format!("{}fwhm * 1.1", first.prefix);
        if let Err(err) = model.add_constraint(
            second,
            PeakAttribute::Fwhm,
            ParameterUpdate::new().expr(expr),
        ) {
            println!("Encountered error {:?}", err);
        }
    }

    let start = Instant::now();
    match model.fit_with(&mut region, FitConfig::default().max_evaluations(500)) {
        Ok(Some(result)) => {
            println!(
                "Fit took milliseconds {}",
                (Instant::now() - start).as_millis()
            );
            println!(
                "{} after {} evaluations, reduced chi-square {:.3}, R^2 {:.5}",
                result.message, result.evaluations, result.reduced_chi_square, result.score
            );
            for peak in region.peaks.iter() {
                println!("\t{}", peak);
            }
        }
        Ok(None) => println!("No peaks to fit"),
        Err(err) => println!("Encountered error {:?}", err),
    };

    for param in model.params().iter() {
        println!("\t{}", param);
    }
    Ok(())
}
