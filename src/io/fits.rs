//! FITS image load/save for science frames and master calibration
//! frames.
//!
//! Images are stored row-major with the FITS bottom-left origin, so
//! pixel rows are flipped vertically on both read and write to match
//! the in-memory `[row, col]` convention. Header keys carry the frame
//! metadata; master frames additionally carry their combination
//! provenance.

use std::path::Path;

use chrono::NaiveDateTime;
use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::hdu::FitsHdu;
use fitsio::compat::images::{ImageDescription, ImageType, ReadImage, WriteImage};
use log::debug;
use ndarray::{s, Array2};

use crate::combine::{CombineMethod, CombineProvenance, MasterFrame};
use crate::error::{Error, Result};
use crate::image::{Frame, FrameMeta, MetaValue, MJD_OFFSET};

/// Timestamp layouts accepted for the DATE-OBS header.
const DATE_OBS_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Read the first 2-D image HDU of a file, flipped into `[row, col]`
/// convention. Returns the HDU so the caller can read header keys.
fn read_image_hdu(fptr: &FitsFile, path: &Path) -> Result<(Array2<f64>, FitsHdu)> {
    let mut hdu_idx = 0;
    while let Ok(hdu) = fptr.hdu(hdu_idx) {
        let naxis = hdu.read_key::<i64>(fptr, "NAXIS").unwrap_or(0);
        if naxis == 2 {
            let naxis1 = hdu.read_key::<i64>(fptr, "NAXIS1").unwrap_or(0) as usize;
            let naxis2 = hdu.read_key::<i64>(fptr, "NAXIS2").unwrap_or(0) as usize;
            let data = f64::read_image(fptr, &hdu).map_err(|e| Error::fits(path, e))?;

            let fits_array = Array2::from_shape_vec((naxis2, naxis1), data).map_err(|_| {
                Error::format(
                    path,
                    format!("image data does not match NAXIS1={naxis1} NAXIS2={naxis2}"),
                )
            })?;
            // FITS origin is bottom-left; flip rows to top-left.
            let flipped = fits_array.slice(s![..;-1, ..]).to_owned();
            return Ok((flipped, hdu));
        }
        hdu_idx += 1;
    }
    Err(Error::format(path, "no 2-D image HDU found"))
}

/// Resolve the observation time from the headers, in precedence order:
/// JD directly, then MJD, then a parsed DATE-OBS timestamp.
fn read_observation_jd(fptr: &FitsFile, hdu: &FitsHdu, path: &Path) -> Result<f64> {
    if let Ok(jd) = hdu.read_key::<f64>(fptr, "JD") {
        return Ok(jd);
    }
    if let Ok(mjd) = hdu.read_key::<f64>(fptr, "MJD") {
        return Ok(mjd + MJD_OFFSET);
    }
    if let Ok(date_obs) = hdu.read_key::<String>(fptr, "DATE-OBS") {
        for format in DATE_OBS_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(date_obs.trim(), format) {
                return Ok(crate::image::datetime_to_jd(naive.and_utc()));
            }
        }
        return Err(Error::format(
            path,
            format!("unparseable DATE-OBS value '{date_obs}'"),
        ));
    }
    Err(Error::format(
        path,
        "no observation time header (JD, MJD or DATE-OBS)",
    ))
}

/// Load a science frame from a FITS file.
///
/// Required headers: EXPTIME, FILTER and an observation time (JD, MJD
/// or DATE-OBS). AIRMASS and OBJECT are picked up when present.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Frame> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let fptr = FitsFile::open(path).map_err(|e| Error::fits(path, e))?;
    let (data, hdu) = read_image_hdu(&fptr, path)?;

    let exposure_s = hdu
        .read_key::<f64>(&fptr, "EXPTIME")
        .map_err(|_| Error::format(path, "missing EXPTIME header"))?;
    let filter = hdu
        .read_key::<String>(&fptr, "FILTER")
        .map_err(|_| Error::format(path, "missing FILTER header"))?;
    let jd = read_observation_jd(&fptr, &hdu, path)?;

    let mut meta = FrameMeta::new(exposure_s, filter.trim(), jd);
    meta.airmass = hdu.read_key::<f64>(&fptr, "AIRMASS").ok();
    meta.object = hdu
        .read_key::<String>(&fptr, "OBJECT")
        .ok()
        .map(|s| s.trim().to_string());

    debug!(
        "loaded {}: {}x{} filter {} JD {}",
        path.display(),
        data.dim().0,
        data.dim().1,
        meta.filter,
        meta.jd
    );
    Frame::new(data, meta)
}

/// Create a single-HDU double-precision image and write the flipped
/// pixel rows into it.
fn write_image_hdu(
    fptr: &mut FitsFile,
    name: &str,
    data: &Array2<f64>,
    path: &Path,
) -> Result<FitsHdu> {
    let (height, width) = data.dim();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: vec![width, height],
    };
    let hdu = fptr
        .create_image(name, &description)
        .map_err(|e| Error::fits(path, e))?;

    let flat: Vec<f64> = data.slice(s![..;-1, ..]).iter().copied().collect();
    f64::write_image(fptr, &hdu, &flat).map_err(|e| Error::fits(path, e))?;
    Ok(hdu)
}

/// Save a science frame, preserving its metadata in the headers.
pub fn save<P: AsRef<Path>>(path: P, frame: &Frame) -> Result<()> {
    let path = path.as_ref();
    let mut fptr = FitsFile::create(path)
        .overwrite()
        .open()
        .map_err(|e| Error::fits(path, e))?;
    let hdu = write_image_hdu(&mut fptr, "SCI", frame.data(), path)?;

    let fits = |e| Error::fits(path, e);
    let meta = frame.meta();
    hdu.write_key(&mut fptr, "EXPTIME", &meta.exposure_s)
        .map_err(fits)?;
    hdu.write_key(&mut fptr, "FILTER", &meta.filter).map_err(fits)?;
    hdu.write_key(&mut fptr, "JD", &meta.jd).map_err(fits)?;
    if let Some(airmass) = meta.airmass {
        hdu.write_key(&mut fptr, "AIRMASS", &airmass).map_err(fits)?;
    }
    if let Some(object) = &meta.object {
        hdu.write_key(&mut fptr, "OBJECT", object).map_err(fits)?;
    }
    for (key, value) in &meta.extra {
        match value {
            MetaValue::Integer(v) => hdu.write_key(&mut fptr, key, v),
            MetaValue::Float(v) => hdu.write_key(&mut fptr, key, v),
            MetaValue::Text(v) => hdu.write_key(&mut fptr, key, v),
            MetaValue::Logical(v) => hdu.write_key(&mut fptr, key, v),
        }
        .map_err(fits)?;
    }
    Ok(())
}

/// Save a master calibration frame with its provenance headers.
pub fn save_master<P: AsRef<Path>>(path: P, master: &MasterFrame) -> Result<()> {
    let path = path.as_ref();
    let mut fptr = FitsFile::create(path)
        .overwrite()
        .open()
        .map_err(|e| Error::fits(path, e))?;
    let hdu = write_image_hdu(&mut fptr, "MASTER", master.data(), path)?;

    let fits = |e| Error::fits(path, e);
    let prov = master.provenance();
    hdu.write_key(&mut fptr, "NCOMBINE", &(prov.frame_count as i64))
        .map_err(fits)?;
    hdu.write_key(&mut fptr, "COMBMETH", &prov.method.name().to_string())
        .map_err(fits)?;
    if let CombineMethod::SigmaClippedMean { sigma, max_iters } = prov.method {
        hdu.write_key(&mut fptr, "CLIPSIG", &sigma).map_err(fits)?;
        hdu.write_key(&mut fptr, "CLIPITER", &(max_iters as i64))
            .map_err(fits)?;
    }
    hdu.write_key(&mut fptr, "NITERUSE", &(prov.iterations_used as i64))
        .map_err(fits)?;
    hdu.write_key(&mut fptr, "FALLBACK", &prov.fallback_fraction)
        .map_err(fits)?;
    Ok(())
}

/// Load a master calibration frame saved by [`save_master`].
pub fn load_master<P: AsRef<Path>>(path: P) -> Result<MasterFrame> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let fptr = FitsFile::open(path).map_err(|e| Error::fits(path, e))?;
    let (data, hdu) = read_image_hdu(&fptr, path)?;

    let frame_count = hdu
        .read_key::<i64>(&fptr, "NCOMBINE")
        .map_err(|_| Error::format(path, "missing NCOMBINE header"))? as usize;
    let method_name = hdu
        .read_key::<String>(&fptr, "COMBMETH")
        .map_err(|_| Error::format(path, "missing COMBMETH header"))?;
    let method = match method_name.trim() {
        "mean" => CombineMethod::Mean,
        "median" => CombineMethod::Median,
        "sigclip" => {
            let sigma = hdu
                .read_key::<f64>(&fptr, "CLIPSIG")
                .map_err(|_| Error::format(path, "missing CLIPSIG header"))?;
            let max_iters = hdu
                .read_key::<i64>(&fptr, "CLIPITER")
                .map_err(|_| Error::format(path, "missing CLIPITER header"))?
                as usize;
            CombineMethod::SigmaClippedMean { sigma, max_iters }
        }
        other => {
            return Err(Error::format(
                path,
                format!("unknown combination method '{other}'"),
            ))
        }
    };
    let iterations_used = hdu.read_key::<i64>(&fptr, "NITERUSE").unwrap_or(0) as usize;
    let fallback_fraction = hdu.read_key::<f64>(&fptr, "FALLBACK").unwrap_or(0.0);

    Ok(MasterFrame::from_parts(
        data,
        CombineProvenance {
            frame_count,
            method,
            iterations_used,
            fallback_fraction,
        },
    ))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    use crate::combine::{combine, CombineMethod};

    use super::*;

    fn gradient_frame() -> Frame {
        let data = Array2::from_shape_fn((6, 8), |(r, c)| 100.0 + r as f64 * 10.0 + c as f64);
        let mut meta = FrameMeta::new(30.0, "V", 2_460_123.625);
        meta.airmass = Some(1.15);
        meta.object = Some("WASP-12".to_string());
        meta.extra
            .insert("GAIN".to_string(), MetaValue::Float(1.4));
        meta.extra
            .insert("OBSERVER".to_string(), MetaValue::Text("survey".to_string()));
        Frame::new(data, meta).unwrap()
    }

    #[test]
    fn frame_round_trips_pixels_and_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("science.fits");
        let original = gradient_frame();

        save(&path, &original).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.dim(), (6, 8));
        for (&a, &b) in loaded.data().iter().zip(original.data().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
        // Orientation check: [0, 0] must come back to [0, 0].
        assert_relative_eq!(loaded.data()[[0, 0]], 100.0);
        assert_relative_eq!(loaded.data()[[5, 7]], 157.0);

        assert_relative_eq!(loaded.meta().exposure_s, 30.0);
        assert_eq!(loaded.meta().filter, "V");
        assert_relative_eq!(loaded.meta().jd, 2_460_123.625, epsilon = 1e-8);
        assert_eq!(loaded.meta().airmass, Some(1.15));
        assert_eq!(loaded.meta().object.as_deref(), Some("WASP-12"));
    }

    #[test]
    fn missing_file_is_not_found() {
        assert!(matches!(
            load("/no/such/dir/frame.fits"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn missing_filter_header_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nofilter.fits");

        let data = Array2::from_elem((4, 4), 5.0);
        let mut fptr = FitsFile::create(&path).overwrite().open().unwrap();
        let description = ImageDescription {
            data_type: ImageType::Double,
            dimensions: vec![4, 4],
        };
        let hdu = fptr.create_image("SCI", &description).unwrap();
        let flat: Vec<f64> = data.iter().copied().collect();
        f64::write_image(&mut fptr, &hdu, &flat).unwrap();
        hdu.write_key(&mut fptr, "EXPTIME", &30.0).unwrap();
        hdu.write_key(&mut fptr, "JD", &2_460_000.5).unwrap();
        drop(fptr);

        match load(&path) {
            Err(Error::Format { reason, .. }) => assert!(reason.contains("FILTER")),
            other => panic!("expected Format error, got {other:?}"),
        }
    }

    #[test]
    fn mjd_and_date_obs_fallbacks() {
        let dir = tempdir().unwrap();

        let write_with_time = |name: &str, set_time: &dyn Fn(&mut FitsFile, &FitsHdu)| {
            let path = dir.path().join(name);
            let mut fptr = FitsFile::create(&path).overwrite().open().unwrap();
            let description = ImageDescription {
                data_type: ImageType::Double,
                dimensions: vec![4, 4],
            };
            let hdu = fptr.create_image("SCI", &description).unwrap();
            let flat = vec![1.0; 16];
            f64::write_image(&mut fptr, &hdu, &flat).unwrap();
            hdu.write_key(&mut fptr, "EXPTIME", &30.0).unwrap();
            hdu.write_key(&mut fptr, "FILTER", &"V".to_string()).unwrap();
            set_time(&mut fptr, &hdu);
            path
        };

        let mjd_path = write_with_time("mjd.fits", &|fptr, hdu| {
            hdu.write_key(fptr, "MJD", &60_123.125).unwrap();
        });
        let frame = load(&mjd_path).unwrap();
        assert_relative_eq!(frame.meta().jd, 60_123.125 + MJD_OFFSET, epsilon = 1e-8);

        let date_path = write_with_time("dateobs.fits", &|fptr, hdu| {
            hdu.write_key(fptr, "DATE-OBS", &"2000-01-01T12:00:00.000".to_string())
                .unwrap();
        });
        let frame = load(&date_path).unwrap();
        // J2000 epoch.
        assert_relative_eq!(frame.meta().jd, 2_451_545.0, epsilon = 1e-8);
    }

    #[test]
    fn master_round_trips_with_provenance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master_bias.fits");

        let frames: Vec<Array2<f64>> = (0..5)
            .map(|k| Array2::from_elem((5, 5), 100.0 + k as f64 * 0.01))
            .collect();
        let master = combine(&frames, CombineMethod::default()).unwrap();

        save_master(&path, &master).unwrap();
        let loaded = load_master(&path).unwrap();

        assert_eq!(loaded.dim(), (5, 5));
        for (&a, &b) in loaded.data().iter().zip(master.data().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
        assert_eq!(loaded.provenance().frame_count, 5);
        assert_eq!(
            loaded.provenance().method,
            CombineMethod::SigmaClippedMean {
                sigma: 3.0,
                max_iters: 5
            }
        );
        assert_relative_eq!(loaded.provenance().fallback_fraction, 0.0);
    }
}
