//! End-to-end imports from an HTTP origin.

mod common;

use common::TestContext;
use importer::{ErrorKind, ProcessingPhase, SourceScheme};
use importer_test_utils::images::{gzip, patterned, qcow2_header, tar_with, xz};
use importer_test_utils::origin::{Origin, OriginConfig};
use sha2::{Digest, Sha256};

// ============================================================================
// RAW IMAGES
// ============================================================================

#[test]
fn raw_image_streams_into_data_file() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).expect("Should start origin");
    let image = patterned(300_000);
    origin.add("/disk.img", image.clone());

    let options = ctx.options(SourceScheme::Http, &origin.url("/disk.img"));
    let mut processor = ctx.processor(&options).expect("Should build processor");
    let phase = processor.process_data().expect("Should import");

    assert_eq!(phase, ProcessingPhase::Complete);
    assert_eq!(std::fs::read(ctx.data_file()).unwrap(), image);
    assert!(ctx.qemu.calls().iter().all(|c| !c.starts_with("convert")));

    let methods: Vec<String> = origin.requests().into_iter().map(|r| r.method).collect();
    assert_eq!(methods, vec!["HEAD".to_string(), "GET".to_string()]);
}

#[test]
fn compressed_images_are_decompressed() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();
    let image = patterned(200_000);
    origin.add("/disk.img.gz", gzip(&image));
    origin.add("/disk.img.xz", xz(&image));

    for path in ["/disk.img.gz", "/disk.img.xz"] {
        let options = ctx.options(SourceScheme::Http, &origin.url(path));
        let mut processor = ctx.processor(&options).expect("Should build processor");
        assert_eq!(processor.process_data().unwrap(), ProcessingPhase::Complete);
        assert_eq!(std::fs::read(ctx.data_file()).unwrap(), image, "{}", path);
    }
}

#[test]
fn user_agent_is_sent() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();
    origin.add("/disk.img", patterned(1000));

    let options = ctx.options(SourceScheme::Http, &origin.url("/disk.img"));
    ctx.processor(&options).unwrap().process_data().unwrap();

    let requests = origin.requests();
    assert!(requests.iter().all(|r| r.header("user-agent") == Some("cdi-importer")));
}

// ============================================================================
// CONVERSION
// ============================================================================

#[test]
fn qcow2_with_ranges_is_converted_from_url() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();
    origin.add("/disk.qcow2", qcow2_header(1 << 20));

    let url = origin.url("/disk.qcow2");
    let options = ctx.options(SourceScheme::Http, &url);
    let mut processor = ctx.processor(&options).unwrap();
    // The fake converter only reads local files, so a direct URL fails here.
    let err = processor.process_data().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(ctx.qemu.calls().contains(&format!("convert {} false", url)));
}

#[test]
fn qcow2_without_ranges_goes_through_scratch() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig {
        accept_ranges: false,
        ..Default::default()
    })
    .unwrap();
    let header = qcow2_header(1 << 20);
    origin.add("/disk.qcow2", header.clone());

    let options = ctx.options(SourceScheme::Http, &origin.url("/disk.qcow2"));
    let mut processor = ctx.processor(&options).unwrap();
    assert_eq!(processor.process_data().unwrap(), ProcessingPhase::Complete);

    assert_eq!(std::fs::read(ctx.data_file()).unwrap(), header);
    let scratch: Vec<_> = std::fs::read_dir(ctx.dir.path().join("scratch")).unwrap().collect();
    assert!(scratch.is_empty(), "scratch space should be cleaned");
}

// ============================================================================
// CHECKSUMS
// ============================================================================

#[test]
fn matching_checksum_passes() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();
    let image = patterned(50_000);
    origin.add("/disk.img", image.clone());

    let mut options = ctx.options(SourceScheme::Http, &origin.url("/disk.img"));
    options.checksum = Some(format!("sha256:{}", hex::encode(Sha256::digest(&image))));
    let mut processor = ctx.processor(&options).unwrap();
    assert_eq!(processor.process_data().unwrap(), ProcessingPhase::Complete);
}

#[test]
fn mismatched_checksum_fails() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();
    origin.add("/disk.img", patterned(50_000));

    let mut options = ctx.options(SourceScheme::Http, &origin.url("/disk.img"));
    options.checksum = Some(format!("sha256:{}", "0".repeat(64)));
    let mut processor = ctx.processor(&options).unwrap();
    let err = processor.process_data().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
}

// ============================================================================
// ARCHIVES AND ERRORS
// ============================================================================

#[test]
fn archive_is_unpacked_into_data_dir() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();
    origin.add(
        "/files.tar",
        tar_with(&[("a.txt", b"alpha".as_slice()), ("b.txt", b"beta".as_slice())]),
    );

    let mut options = ctx.options(SourceScheme::Http, &origin.url("/files.tar"));
    options.content_type = importer::ContentType::Archive;
    let mut processor = ctx.processor(&options).unwrap();
    assert_eq!(processor.process_data().unwrap(), ProcessingPhase::Complete);

    assert_eq!(std::fs::read(ctx.data_dir().join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(ctx.data_dir().join("b.txt")).unwrap(), b"beta");
}

#[test]
fn missing_object_fails_to_build() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig::default()).unwrap();

    let options = ctx.options(SourceScheme::Http, &origin.url("/missing.img"));
    let err = ctx.processor(&options).err().expect("Should fail on 404");
    assert_eq!(err.kind(), ErrorKind::UnexpectedStatus);
}

#[test]
fn node_server_labels_reach_termination_message() {
    let ctx = TestContext::new();
    let origin = Origin::serve(OriginConfig {
        info_env: vec![
            "INSTANCETYPE_KUBEVIRT_IO_DEFAULT_PREFERENCE=fedora".into(),
            "PATH=/usr/bin".into(),
        ],
        ..Default::default()
    })
    .unwrap();
    origin.add("/disk.img", patterned(4096));

    let mut options = ctx.options(SourceScheme::Http, &origin.url("/disk.img"));
    options.pull_method = "node".into();
    let mut processor = ctx.processor(&options).unwrap();
    processor.process_data().unwrap();

    let message = processor.termination_message();
    let labels = message.labels.expect("Should carry labels");
    assert_eq!(
        labels.get("instancetype.kubevirt.io/default-preference").map(String::as_str),
        Some("fedora")
    );
    assert_eq!(labels.len(), 1);
}
