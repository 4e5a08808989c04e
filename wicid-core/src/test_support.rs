// In-memory fakes shared by unit tests

use crate::platform::{DeviceControl, HttpClient, HttpResponse};
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MACHINE: &str = "Adafruit QT Py ESP32S3 4MB 2MB PSRAM";
pub const OS: &str = "circuitpython_10_1";

#[derive(Default)]
pub struct FakeHttp {
    routes: RefCell<HashMap<String, (u16, Vec<u8>)>>,
    pub requests: RefCell<Vec<(String, Vec<(String, String)>)>>,
}

impl FakeHttp {
    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.serve_status(url, 200, body);
    }

    pub fn serve_status(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes.borrow_mut().insert(url.to_string(), (status, body.into()));
    }

    pub fn header(&self, index: usize, name: &str) -> Option<String> {
        self.requests.borrow()[index]
            .1
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }
}

impl HttpClient for FakeHttp {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> anyhow::Result<Box<dyn HttpResponse>> {
        self.requests.borrow_mut().push((
            url.to_string(),
            headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        ));
        match self.routes.borrow().get(url) {
            Some((status, body)) => Ok(Box::new(FakeResponse {
                status: *status,
                body: body.clone(),
                pos: 0,
            })),
            None => anyhow::bail!("connection refused: {}", url),
        }
    }
}

struct FakeResponse {
    status: u16,
    body: Vec<u8>,
    pos: usize,
}

impl HttpResponse for FakeResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.body.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let n = buf.len().min(self.body.len() - self.pos);
        buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Default)]
pub struct RecordingDevice {
    pub resets: RefCell<Vec<String>>,
    pub safe_mode: RefCell<Vec<String>>,
}

impl DeviceControl for RecordingDevice {
    fn hard_reset(&self, reason: &str) {
        self.resets.borrow_mut().push(reason.to_string());
    }

    fn enter_safe_mode(&self, reason: &str) {
        self.safe_mode.borrow_mut().push(reason.to_string());
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub fn bundle_manifest_json(version: &str) -> String {
    format!(
        r#"{{"schema_version": "1.0.0", "version": "{}", "target_machine_types": ["{}"], "target_operating_systems": ["circuitpython_10_0"], "release_type": "production"}}"#,
        version, MACHINE
    )
}

/// Zip the given files, deflated
pub fn zip_bundle(files: &[(&str, &[u8])]) -> Vec<u8> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// A complete full-release bundle with every default critical file
pub fn full_bundle(version: &str) -> Vec<u8> {
    full_bundle_with(version, &[])
}

/// A full-release bundle plus extra files
pub fn full_bundle_with(version: &str, extra: &[(&str, &[u8])]) -> Vec<u8> {
    let manifest = bundle_manifest_json(version);
    let settings = format!(r#"{{"version": "{}"}}"#, version);
    let firmware = format!("firmware {}", version);
    let mut files: Vec<(&str, &[u8])> = vec![
        ("manifest.json", manifest.as_bytes()),
        ("settings.json", settings.as_bytes()),
        ("firmware/wicid.bin", firmware.as_bytes()),
    ];
    files.extend_from_slice(extra);
    zip_bundle(&files)
}
