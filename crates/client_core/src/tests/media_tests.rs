use super::*;
use std::{
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 40, 40])));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

fn data_uri(width: u32, height: u32) -> ImageRef {
    ImageRef::new(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(png_bytes(width, height))
    ))
}

fn temp_png(name: &str, width: u32, height: u32) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = env::temp_dir().join(format!("insight_media_test_{suffix}"));
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join(name);
    fs::write(&path, png_bytes(width, height)).expect("write png");
    path
}

fn decoded_dimensions(encoded: &str) -> (u32, u32) {
    let bytes = STANDARD.decode(encoded).expect("base64");
    image::load_from_memory(&bytes).expect("jpeg").dimensions()
}

#[test]
fn bare_path_is_qualified_into_file_url() {
    let url = qualify_path(Path::new("drawings/cat.png")).expect("qualify");
    assert_eq!(url.scheme(), "file");
    assert!(url.path().ends_with("/drawings/cat.png"));
}

#[test]
fn data_uri_resolves_inline_without_touching_disk() {
    let resolved = resolve_reference(&data_uri(4, 4)).expect("resolve");
    match resolved {
        ResolvedSource::Inline(bytes) => assert_eq!(bytes, png_bytes(4, 4)),
        other => panic!("expected inline source, got {other:?}"),
    }
}

#[test]
fn file_url_resolves_to_path() {
    let resolved = resolve_reference(&ImageRef::from("file:///tmp/drawing.png")).expect("resolve");
    assert_eq!(resolved, ResolvedSource::File(PathBuf::from("/tmp/drawing.png")));
}

#[test]
fn remote_scheme_is_rejected() {
    let err = resolve_reference(&ImageRef::from("https://example.com/a.png"))
        .expect_err("remote refs are not local");
    assert!(matches!(err, MediaError::UnsupportedScheme { .. }));
}

#[test]
fn non_base64_data_uri_is_rejected() {
    let err = resolve_reference(&ImageRef::from("data:image/png,raw"))
        .expect_err("plain data uri");
    assert!(matches!(err, MediaError::InvalidReference { .. }));
}

#[test]
fn oversized_images_are_downscaled_within_bounds() {
    let options = PipelineOptions {
        max_dimension: 64,
        jpeg_quality: 70,
    };
    let encoded = encode_for_transport(&png_bytes(256, 128), options).expect("encode");
    let (width, height) = decoded_dimensions(&encoded);
    assert!(width <= 64 && height <= 64, "got {width}x{height}");
    assert_eq!(width, 64);
}

#[test]
fn small_images_keep_their_size() {
    let encoded = encode_for_transport(&png_bytes(20, 10), PipelineOptions::default())
        .expect("encode");
    assert_eq!(decoded_dimensions(&encoded), (20, 10));
}

#[test]
fn undecodable_bytes_fail() {
    let err = encode_for_transport(b"not an image", PipelineOptions::default())
        .expect_err("garbage");
    assert!(matches!(err, MediaError::Decode(_)));
}

#[tokio::test]
async fn normalize_orders_payloads_by_slot_and_labels_them() {
    let path = temp_png("tree.png", 8, 8);
    let mut slots = BTreeMap::new();
    slots.insert(SlotId::from("tree"), ImageRef::new(path.display().to_string()));
    slots.insert(SlotId::from("house"), data_uri(8, 8));
    slots.insert(SlotId::from("person"), data_uri(6, 6));

    let payloads = ImagePipeline::default()
        .normalize(ProtocolId::HouseTreePerson, &slots)
        .await
        .expect("normalize");

    let ids: Vec<_> = payloads.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["house", "person", "tree"]);
    let labels: Vec<_> = payloads.iter().map(|p| p.label.as_str()).collect();
    assert_eq!(labels, vec!["House", "Person", "Tree"]);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[tokio::test]
async fn normalize_is_reproducible_for_the_same_input() {
    let mut slots = BTreeMap::new();
    slots.insert(SlotId::from("quick"), data_uri(12, 12));
    let pipeline = ImagePipeline::default();

    let first = pipeline.normalize(ProtocolId::Quick, &slots).await.expect("first");
    let second = pipeline.normalize(ProtocolId::Quick, &slots).await.expect("second");
    assert_eq!(first, second);
}

#[tokio::test]
async fn one_bad_image_fails_the_whole_batch() {
    let mut slots = BTreeMap::new();
    slots.insert(SlotId::from("house"), data_uri(8, 8));
    slots.insert(
        SlotId::from("tree"),
        ImageRef::from("/definitely/not/here/tree.png"),
    );

    let err = ImagePipeline::default()
        .normalize(ProtocolId::HouseTreePerson, &slots)
        .await
        .expect_err("missing file");
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].0, SlotId::from("tree"));
    assert!(matches!(err.failures[0].1, MediaError::Read { .. }));
    assert!(err.to_string().contains("tree"));
}

#[tokio::test]
async fn empty_slot_set_yields_no_payloads() {
    let payloads = ImagePipeline::default()
        .normalize(ProtocolId::Observation, &BTreeMap::new())
        .await
        .expect("empty");
    assert!(payloads.is_empty());
}
