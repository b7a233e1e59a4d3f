//! End-to-end reduction chain on synthetic observations: master frame
//! construction, calibration, detection, aperture photometry and
//! differential light-curve assembly, with FITS persistence.

use approx::assert_relative_eq;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use exophot::combine::{master_bias, master_flat, CombineMethod};
use exophot::image::{Frame, FrameMeta};
use exophot::lightcurve::LightCurveConfig;
use exophot::photometry::Aperture;
use exophot::{calibrate, detect, io, lightcurve};

const SHAPE: (usize, usize) = (128, 128);
const BIAS_LEVEL: f64 = 100.0;
const READ_NOISE: f64 = 2.0;
const SKY_LEVEL: f64 = 200.0;

const TARGET: (f64, f64) = (40.0, 40.0);
const COMPS: [(f64, f64); 2] = [(40.0, 90.0), (90.0, 40.0)];

fn noise_frame(rng: &mut StdRng, level: f64, sigma: f64) -> Array2<f64> {
    let normal = Normal::new(0.0, sigma).unwrap();
    Array2::from_shape_fn(SHAPE, |_| level + normal.sample(rng))
}

/// Radial vignetting profile, 1.0 at the center falling to 0.85 at the
/// corners.
fn vignette(r: usize, c: usize) -> f64 {
    let dr = r as f64 - SHAPE.0 as f64 / 2.0;
    let dc = c as f64 - SHAPE.1 as f64 / 2.0;
    let r2_max = (SHAPE.0 as f64 / 2.0).powi(2) + (SHAPE.1 as f64 / 2.0).powi(2);
    1.0 - 0.15 * (dr * dr + dc * dc) / r2_max
}

fn add_star(image: &mut Array2<f64>, row: f64, col: f64, total_flux: f64, sigma: f64) {
    let norm = total_flux / (2.0 * std::f64::consts::PI * sigma * sigma);
    for ((r, c), v) in image.indexed_iter_mut() {
        let dr = r as f64 - row;
        let dc = c as f64 - col;
        *v += norm * (-(dr * dr + dc * dc) / (2.0 * sigma * sigma)).exp();
    }
}

/// Synthetic raw science frame: stars and sky through the vignetting
/// profile, plus the bias pedestal and read noise.
fn science_frame(rng: &mut StdRng, jd: f64, target_flux: f64) -> Frame {
    let mut signal = Array2::from_elem(SHAPE, SKY_LEVEL);
    add_star(&mut signal, TARGET.0, TARGET.1, target_flux, 1.8);
    add_star(&mut signal, COMPS[0].0, COMPS[0].1, 100_000.0, 1.8);
    add_star(&mut signal, COMPS[1].0, COMPS[1].1, 120_000.0, 1.8);

    let normal = Normal::new(0.0, READ_NOISE).unwrap();
    let data = Array2::from_shape_fn(SHAPE, |(r, c)| {
        signal[[r, c]] * vignette(r, c) + BIAS_LEVEL + normal.sample(rng)
    });
    Frame::new(data, FrameMeta::new(60.0, "V", jd)).unwrap()
}

#[test]
fn full_reduction_and_light_curve() {
    let mut rng = StdRng::seed_from_u64(20_260_829);

    // Master bias from five noisy zero-exposure frames.
    let bias_frames: Vec<Array2<f64>> = (0..5)
        .map(|_| noise_frame(&mut rng, BIAS_LEVEL, READ_NOISE))
        .collect();
    let bias = master_bias(&bias_frames, CombineMethod::default()).unwrap();
    assert_relative_eq!(bias.data().mean().unwrap(), BIAS_LEVEL, epsilon = 0.1);

    // Flats at two illumination levels through the same vignetting.
    let flat_frames: Vec<Array2<f64>> = [10_000.0, 16_000.0, 12_000.0, 14_000.0, 11_000.0]
        .iter()
        .map(|&level| {
            let noise = noise_frame(&mut rng, BIAS_LEVEL, READ_NOISE);
            Array2::from_shape_fn(SHAPE, |(r, c)| noise[[r, c]] + level * vignette(r, c))
        })
        .collect();
    let flat = master_flat(&flat_frames, Some(&bias), CombineMethod::default()).unwrap();

    // Unit median, and the vignetting shape survives combination.
    let mut values: Vec<f64> = flat.data().iter().copied().collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_relative_eq!(values[values.len() / 2], 1.0, epsilon = 1e-3);
    let center = flat.data()[[64, 64]];
    let corner = flat.data()[[0, 0]];
    assert_relative_eq!(corner / center, vignette(0, 0), epsilon = 5e-3);

    // Six science frames; the fifth carries a 2% transit dip.
    let frames: Vec<Frame> = (0..6)
        .map(|i| {
            let depth = if i == 4 { 0.98 } else { 1.0 };
            science_frame(&mut rng, 2_460_500.5 + i as f64 * 0.01, 80_000.0 * depth)
        })
        .collect();

    let calibrated = calibrate::calibrate_batch(&frames, &bias, &flat);
    let calibrated: Vec<Frame> = calibrated
        .into_iter()
        .map(|r| {
            let c = r.unwrap();
            assert_eq!(c.masked_pixels, 0);
            c.frame
        })
        .collect();

    // Flat-field structure is gone: star-free sky corners agree.
    let first = calibrated[0].data();
    let sky_corner = first[[2, 125]];
    let sky_center = first[[64, 2]];
    assert_relative_eq!(sky_corner / sky_center, 1.0, epsilon = 0.05);

    // All three stars are recovered with sub-pixel centroids.
    let sources = detect::detect(&first.view(), 5.0);
    assert!(sources.len() >= 3, "found only {} sources", sources.len());
    for expected in [COMPS[1], COMPS[0], TARGET] {
        let found = sources
            .iter()
            .any(|s| (s.row - expected.0).abs() < 0.5 && (s.col - expected.1).abs() < 0.5);
        assert!(found, "no source near {expected:?}");
    }

    // Differential light curve recovers the transit depth.
    let config = LightCurveConfig {
        aperture: Aperture::new(5.5, 9.0, 13.0).unwrap(),
        recentroid_radius: 6,
    };
    let curve = lightcurve::build(&calibrated, TARGET, &COMPS, &config).unwrap();
    assert_eq!(curve.points.len(), 6);
    assert!(curve.gaps.is_empty());

    for (i, point) in curve.points.iter().enumerate() {
        if i == 4 {
            assert_relative_eq!(point.relative_flux, 0.98, epsilon = 5e-3);
        } else {
            assert_relative_eq!(point.relative_flux, 1.0, epsilon = 5e-3);
        }
        assert!(point.uncertainty > 0.0 && point.uncertainty < 0.01);
    }

    // The tabular artifact is written with one row per point.
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("lightcurve.csv");
    curve.write_csv(&csv_path).unwrap();
    let contents = std::fs::read_to_string(&csv_path).unwrap();
    assert_eq!(contents.lines().count(), 7);
}

#[test]
fn masters_and_frames_persist_through_fits() {
    let mut rng = StdRng::seed_from_u64(7);
    let dir = tempfile::tempdir().unwrap();

    let bias_frames: Vec<Array2<f64>> = (0..3)
        .map(|_| noise_frame(&mut rng, BIAS_LEVEL, READ_NOISE))
        .collect();
    let bias = master_bias(&bias_frames, CombineMethod::Median).unwrap();

    let bias_path = dir.path().join("master_bias.fits");
    io::save_master(&bias_path, &bias).unwrap();
    let bias_back = io::load_master(&bias_path).unwrap();
    assert_eq!(bias_back.provenance().frame_count, 3);
    assert_eq!(bias_back.provenance().method, CombineMethod::Median);
    for (&a, &b) in bias_back.data().iter().zip(bias.data().iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-10);
    }

    let science = science_frame(&mut rng, 2_460_500.5, 80_000.0);
    let sci_path = dir.path().join("science.fits");
    io::save(&sci_path, &science).unwrap();
    let science_back = io::load(&sci_path).unwrap();

    assert_eq!(science_back.dim(), SHAPE);
    assert_eq!(science_back.meta().filter, "V");
    assert_relative_eq!(science_back.meta().jd, 2_460_500.5, epsilon = 1e-8);
    for (&a, &b) in science_back.data().iter().zip(science.data().iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-10);
    }
}
