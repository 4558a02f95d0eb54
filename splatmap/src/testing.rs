//! Scripted stand-ins for the external engines and reviewers.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use exif::experimental::Writer;
use exif::{Field, In, Rational, Tag, Value};
use glam::DVec3;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::batch::Batch;
use crate::colmap::{IMAGES_FILE, POINTS_FILE};
use crate::dataset::{Dataset, IMAGES_DIR, SPARSE_DIR, SPLAT_FILE};
use crate::image::Image;
use crate::job::{
    JobError, JobFuture, JobRequest, JobResult, ReconstructionEngine, SplatTrainer,
};
use crate::quality::{Evaluation, ReviewDecision, ReviewFuture, Reviewer};

/// Writes a text sparse model registering `images` (stored name, camera
/// centre) with identity rotations. Every point is seen by three cameras.
pub fn write_text_model(
    dir: &Path,
    images: &[(String, DVec3)],
    reprojection_error: f64,
) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut images_txt = String::from("# Image list with two lines of data per image:\n");
    for (index, (name, center)) in images.iter().enumerate() {
        // identity rotation, so t = -C
        let t = -*center;
        let _ = writeln!(
            images_txt,
            "{} 1 0 0 0 {} {} {} 1 {}",
            index + 1,
            t.x,
            t.y,
            t.z,
            name
        );
        let _ = writeln!(images_txt, "100.0 200.0 {} 300.0 400.0 -1", index + 1);
    }
    fs::write(dir.join(IMAGES_FILE), images_txt)?;

    let mut points_txt = String::from("# 3D point list\n");
    for index in 0..images.len() {
        let _ = writeln!(
            points_txt,
            "{} 0 0 0 128 128 128 {} 1 0 2 0 3 0",
            index + 1,
            reprojection_error
        );
    }
    fs::write(dir.join(POINTS_FILE), points_txt)
}

/// Images with real files under `dir`, each carrying `hint`.
pub fn images_in(dir: &Path, count: usize, hint: Option<DVec3>) -> io::Result<Vec<Image>> {
    fs::create_dir_all(dir)?;
    (0..count)
        .map(|index| {
            let name = format!("IMG_{index:04}.jpg");
            let path = dir.join(&name);
            fs::write(&path, name.as_bytes())?;
            let mut image = Image::new(name, path, Utc::now());
            image.hint = hint;
            Ok(image)
        })
        .collect()
}

pub fn batch_in(dir: &Path, count: usize, hint: Option<DVec3>) -> io::Result<Batch> {
    Ok(Batch::new(images_in(dir, count, hint)?))
}

// === EXIF fixtures ===

pub fn exif_field(tag: Tag, value: Value) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value,
    }
}

pub fn exif_ascii(text: &str) -> Value {
    Value::Ascii(vec![text.as_bytes().to_vec()])
}

fn exif_dms(degrees: u32, minutes: u32, centiseconds: u32) -> Value {
    Value::Rational(vec![
        Rational { num: degrees, denom: 1 },
        Rational { num: minutes, denom: 1 },
        Rational {
            num: centiseconds,
            denom: 100,
        },
    ])
}

/// Taken 2024-05-17 09:30:15 at 33°51'36" S, 151°12'18" E, 58.5 m.
pub fn tagged_exif_fields() -> Vec<Field> {
    vec![
        exif_field(Tag::Make, exif_ascii("TestCam")),
        exif_field(Tag::DateTimeOriginal, exif_ascii("2024:05:17 09:30:15")),
        exif_field(Tag::GPSLatitudeRef, exif_ascii("S")),
        exif_field(Tag::GPSLatitude, exif_dms(33, 51, 3600)),
        exif_field(Tag::GPSLongitudeRef, exif_ascii("E")),
        exif_field(Tag::GPSLongitude, exif_dms(151, 12, 1800)),
        exif_field(Tag::GPSAltitudeRef, Value::Byte(vec![0])),
        exif_field(
            Tag::GPSAltitude,
            Value::Rational(vec![Rational { num: 585, denom: 10 }]),
        ),
    ]
}

/// Writes a JPEG holding nothing but an EXIF segment with `fields`.
pub fn write_exif_jpeg(path: &Path, fields: &[Field]) -> anyhow::Result<()> {
    let mut writer = Writer::new();
    for field in fields {
        writer.push_field(field);
    }
    let mut tiff = Cursor::new(Vec::new());
    writer.write(&mut tiff, false)?;
    let tiff = tiff.into_inner();

    let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
    jpeg.extend_from_slice(&u16::try_from(tiff.len() + 8)?.to_be_bytes());
    jpeg.extend_from_slice(b"Exif\0\0");
    jpeg.extend_from_slice(&tiff);
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    fs::write(path, jpeg)?;
    Ok(())
}

// === Fake reconstruction engine ===

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineScript {
    /// Registers every known image at its scripted position.
    Register,
    /// Exits with an error before writing anything.
    Fail,
    /// Runs longer than any test timeout unless cancelled.
    Hang,
}

/// Registers images found in `<dataset>/images` whose stored name has a
/// scripted position; unknown names stay unregistered.
#[derive(Debug)]
pub struct FakeEngine {
    positions: Mutex<HashMap<String, DVec3>>,
    script: Mutex<EngineScript>,
    reprojection_error: f64,
    calls: AtomicUsize,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            script: Mutex::new(EngineScript::Register),
            reprojection_error: 0.6,
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeEngine {
    pub fn with_script(script: EngineScript) -> Self {
        let engine = Self::default();
        engine.set_script(script);
        engine
    }

    pub fn set_script(&self, script: EngineScript) {
        *self.script.lock() = script;
    }

    pub fn place(&self, image: &Image, position: DVec3) {
        self.positions.lock().insert(image.stored_name(), position);
    }

    pub fn place_all<'a>(&self, images: impl IntoIterator<Item = &'a Image>, map: impl Fn(usize) -> DVec3) {
        for (index, image) in images.into_iter().enumerate() {
            self.place(image, map(index));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn run(&self, request: JobRequest) -> JobResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock();

        match script {
            EngineScript::Fail => {
                return Err(JobError::Spawn {
                    program: "fake mapper".to_string(),
                    source: io::Error::other("no overlapping features"),
                })
            }
            EngineScript::Hang => {
                let program = "fake mapper".to_string();
                return tokio::select! {
                    _ = tokio::time::sleep(request.timeout) => Err(JobError::Timeout {
                        program,
                        timeout: request.timeout,
                    }),
                    _ = request.cancel.cancelled() => Err(JobError::Cancelled { program }),
                };
            }
            EngineScript::Register => {}
        }

        let images_dir = request.dataset_dir.join(IMAGES_DIR);
        let mut names: Vec<String> = fs::read_dir(&images_dir)
            .map_err(|source| JobError::Workspace {
                path: images_dir.clone(),
                source,
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let registered: Vec<(String, DVec3)> = {
            let positions = self.positions.lock();
            names
                .into_iter()
                .filter_map(|name| positions.get(&name).map(|p| (name.clone(), *p)))
                .collect()
        };

        let model = request.dataset_dir.join(SPARSE_DIR).join("0");
        write_text_model(&model, &registered, self.reprojection_error)
            .map_err(|source| JobError::Workspace {
                path: model.clone(),
                source,
            })?;
        Ok(model)
    }
}

impl ReconstructionEngine for FakeEngine {
    fn reconstruct(&self, request: JobRequest) -> JobFuture<'_> {
        Box::pin(self.run(request))
    }
}

// === Fake trainer ===

#[derive(Debug, Default)]
pub struct FakeTrainer {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeTrainer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SplatTrainer for FakeTrainer {
    fn train(&self, request: JobRequest) -> JobFuture<'_> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let output = request.dataset_dir.join(SPLAT_FILE);
            if self.fail {
                return Err(JobError::MissingArtifact(output));
            }
            tokio::fs::write(&output, b"ply\nformat binary_little_endian 1.0\nend_header\n")
                .await
                .map_err(|source| JobError::Workspace {
                    path: output.clone(),
                    source,
                })?;
            Ok(output)
        })
    }
}

// === Reviewer ===

#[derive(Debug)]
pub struct FixedReviewer {
    decision: ReviewDecision,
    calls: AtomicUsize,
}

impl FixedReviewer {
    pub fn new(decision: ReviewDecision) -> Self {
        Self {
            decision,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Reviewer for FixedReviewer {
    fn review<'a>(&'a self, _staging: &'a Dataset, _evaluation: &'a Evaluation) -> ReviewFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decision.clone()
        })
    }
}
