use imagegate::client::DeviceClass;
use imagegate::config::GatewayConfig;
use imagegate::invoke::PassthroughTransformer;
use imagegate::metadata::{
    Confidence, ImageMetadata, MetadataOrigin, MetadataService, ProcessOptions,
};
use imagegate::options::ContentKind;
use imagegate::storage::StorageResolver;
use std::sync::Arc;

fn service() -> Arc<MetadataService> {
    let config = Arc::new(GatewayConfig::default());
    let resolver = Arc::new(StorageResolver::new(Arc::clone(&config), None));
    MetadataService::new(config, resolver, Arc::new(PassthroughTransformer))
}

fn metadata(width: u32, height: u32) -> ImageMetadata {
    ImageMetadata {
        width,
        height,
        format: Some("jpeg".into()),
        confidence: Confidence::High,
        source: MetadataOrigin::Direct,
        original_payload: None,
    }
}

#[test]
fn aspect_crop_matches_target_ratio_and_fits_inside_original() {
    let service = service();
    let cases = [
        (800u32, 600u32, 16u32, 9u32),
        (600, 800, 16, 9),
        (1200, 1800, 1, 1),
        (1920, 1080, 4, 5),
        (3000, 1000, 2, 3),
        (1000, 3000, 16, 5),
        (1024, 768, 21, 9),
    ];
    for (w, h, aw, ah) in cases {
        let target = aw as f64 / ah as f64;
        if ((w as f64 / h as f64) - target).abs() <= 0.01 {
            continue;
        }
        let result = service.process_metadata(
            &metadata(w, h),
            Some((aw, ah)),
            &ProcessOptions::default(),
        );
        let crop = result.aspect_crop.expect("aspect differs, crop expected");
        let ratio = crop.width as f64 / crop.height as f64;
        assert!(
            (ratio - target).abs() < 0.01,
            "{}x{} -> {}:{} produced {}x{}",
            w,
            h,
            aw,
            ah,
            crop.width,
            crop.height
        );
        assert!(crop.width <= w && crop.height <= h);
    }
}

#[test]
fn near_identical_ratio_produces_no_crop() {
    let service = service();
    let result = service.process_metadata(
        &metadata(1600, 900),
        Some((16, 9)),
        &ProcessOptions::default(),
    );
    assert!(result.aspect_crop.is_none());
}

#[test]
fn processing_is_deterministic() {
    let service = service();
    let opts = ProcessOptions {
        content_type: Some(ContentKind::Portrait),
        device_type: Some(DeviceClass::Tablet),
        ..Default::default()
    };
    let first = service.process_metadata(&metadata(2400, 1600), Some((1, 1)), &opts);
    let second = service.process_metadata(&metadata(2400, 1600), Some((1, 1)), &opts);
    assert_eq!(first, second);
}

#[test]
fn square_crop_of_portrait_image_preserves_width() {
    // 1200x1800 cropped to 1:1 keeps the full width.
    let service = service();
    let result = service.process_metadata(
        &metadata(1200, 1800),
        Some((1, 1)),
        &ProcessOptions {
            content_type: Some(ContentKind::Portrait),
            ..Default::default()
        },
    );
    let crop = result.aspect_crop.unwrap();
    assert_eq!((crop.width, crop.height), (1200, 1200));
    assert_eq!((crop.hoffset, crop.voffset), (0.5, 0.33));
}

#[test]
fn wide_image_cropped_to_taller_target_preserves_height() {
    let service = service();
    let result = service.process_metadata(
        &metadata(3000, 1000),
        Some((4, 3)),
        &ProcessOptions::default(),
    );
    let crop = result.aspect_crop.unwrap();
    assert_eq!(crop.height, 1000);
    assert_eq!(crop.width, 1333);
}

#[test]
fn explicit_width_drives_crop_dimensions() {
    let service = service();
    let result = service.process_metadata(
        &metadata(4000, 3000),
        Some((16, 9)),
        &ProcessOptions {
            width: Some(800),
            ..Default::default()
        },
    );
    let crop = result.aspect_crop.unwrap();
    assert_eq!((crop.width, crop.height), (800, 450));
}

#[test]
fn allow_expansion_keeps_original_rectangle() {
    let service = service();
    let result = service.process_metadata(
        &metadata(1000, 1000),
        Some((16, 9)),
        &ProcessOptions {
            allow_expansion: true,
            ..Default::default()
        },
    );
    let crop = result.aspect_crop.unwrap();
    assert!(crop.allow_expansion);
    assert_eq!((crop.width, crop.height), (1000, 1000));
}

#[test]
fn platform_table_supplies_target_aspect() {
    let service = service();
    // Instagram is 1:1; a 1200x1800 source gets the square crop.
    let result = service.process_metadata(
        &metadata(1200, 1800),
        None,
        &ProcessOptions {
            platform: Some("instagram".into()),
            ..Default::default()
        },
    );
    let crop = result.aspect_crop.unwrap();
    assert_eq!((crop.width, crop.height), (1200, 1200));

    // Unknown platforms change nothing.
    let result = service.process_metadata(
        &metadata(1200, 1800),
        None,
        &ProcessOptions {
            platform: Some("myspace".into()),
            ..Default::default()
        },
    );
    assert!(result.aspect_crop.is_none());
}

#[test]
fn explicit_focal_point_wins_over_content_table() {
    let service = service();
    let result = service.process_metadata(
        &metadata(1200, 1800),
        Some((1, 1)),
        &ProcessOptions {
            content_type: Some(ContentKind::Portrait),
            focal_point: Some("0.25,0.75".parse().unwrap()),
            ..Default::default()
        },
    );
    let crop = result.aspect_crop.unwrap();
    assert_eq!((crop.hoffset, crop.voffset), (0.25, 0.75));
}

#[test]
fn content_type_focal_table() {
    let service = service();
    let expectations = [
        (ContentKind::Portrait, (0.5, 0.33)),
        (ContentKind::Landscape, (0.4, 0.4)),
        (ContentKind::Product, (0.5, 0.5)),
        (ContentKind::Banner, (0.5, 0.5)),
        (ContentKind::Profile, (0.5, 0.25)),
    ];
    for (content, offsets) in expectations {
        let result = service.process_metadata(
            &metadata(2000, 1000),
            Some((1, 1)),
            &ProcessOptions {
                content_type: Some(content),
                ..Default::default()
            },
        );
        let crop = result.aspect_crop.unwrap();
        assert_eq!((crop.hoffset, crop.voffset), offsets, "{:?}", content);
    }
}

#[test]
fn device_caps_scale_reported_dimensions() {
    let service = service();
    let result = service.process_metadata(
        &metadata(3600, 2400),
        None,
        &ProcessOptions {
            device_type: Some(DeviceClass::Mobile),
            ..Default::default()
        },
    );
    assert_eq!((result.width, result.height), (600, 400));

    let result = service.process_metadata(
        &metadata(3600, 2400),
        None,
        &ProcessOptions {
            device_type: Some(DeviceClass::Desktop),
            ..Default::default()
        },
    );
    assert_eq!((result.width, result.height), (1800, 1200));
}

#[test]
fn quality_depends_on_megapixels() {
    let service = service();
    let big = service.process_metadata(&metadata(2000, 2000), None, &ProcessOptions::default());
    assert_eq!(big.quality, Some(80));

    let small = service.process_metadata(&metadata(800, 600), None, &ProcessOptions::default());
    assert_eq!(small.quality, Some(85));
}

#[test]
fn quality_factor_is_applied_and_clamped() {
    let service = service();
    let halved = service.process_metadata(
        &metadata(800, 600),
        None,
        &ProcessOptions {
            quality_factor: Some(0.5),
            ..Default::default()
        },
    );
    assert_eq!(halved.quality, Some(43));

    let boosted = service.process_metadata(
        &metadata(800, 600),
        None,
        &ProcessOptions {
            quality_factor: Some(3.0),
            ..Default::default()
        },
    );
    assert_eq!(boosted.quality, Some(100));
}
