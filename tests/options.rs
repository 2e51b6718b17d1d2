use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use imagegate::config::builtin_derivative;
use imagegate::options::conditions::{apply_conditions, parse_condition, parse_then_options};
use imagegate::options::{
    cache_key_basis, AspectRatio, Fit, Format, Gravity, GravityPosition, TransformOptions,
};
use imagegate::storage::{HttpPayload, SourceOrigin, StorageResult};
use std::collections::BTreeMap;

fn pairs(query: &str) -> Vec<(String, String)> {
    serde_urlencoded::from_str(query).unwrap()
}

fn storage_result(content_type: &str, width: Option<u32>, height: Option<u32>) -> StorageResult {
    StorageResult {
        payload: HttpPayload {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"fake-image-bytes"),
        },
        source: SourceOrigin::R2,
        content_type: Some(content_type.to_string()),
        size: 16,
        path: "/test.jpg".to_string(),
        original_url: None,
        width,
        height,
        metadata: BTreeMap::new(),
    }
}

#[test]
fn parses_basic_dimensional_options() {
    let (opts, warnings) = TransformOptions::from_query_pairs(&pairs(
        "width=400&height=300&fit=cover&quality=80&format=webp",
    ));
    assert!(warnings.is_empty());
    assert_eq!(opts.width, Some(400));
    assert_eq!(opts.height, Some(300));
    assert_eq!(opts.fit, Some(Fit::Cover));
    assert_eq!(opts.quality, Some(80));
    assert_eq!(opts.format, Some(Format::Webp));
}

#[test]
fn auto_width_sets_marker_not_dimension() {
    let (opts, _) = TransformOptions::from_query_pairs(&pairs("width=auto&quality=auto"));
    assert_eq!(opts.width, None);
    assert_eq!(opts.quality, None);
}

#[test]
fn invalid_format_becomes_auto_with_warning() {
    let (opts, warnings) = TransformOptions::from_query_pairs(&pairs("format=xyz"));
    assert_eq!(opts.format, Some(Format::Auto));
    assert_eq!(warnings.len(), 1);
}

#[test]
fn blur_above_range_is_clamped() {
    let (mut opts, _) = TransformOptions::from_query_pairs(&pairs("blur=400"));
    let warnings = opts.validate();
    assert_eq!(opts.blur, Some(250));
    assert!(!warnings.is_empty());
}

#[test]
fn out_of_range_gravity_resets_to_center() {
    let mut opts = TransformOptions::default();
    opts.gravity = Some(Gravity::Coord { x: 2.0, y: -1.0 });
    opts.validate();
    assert_eq!(opts.gravity, Some(Gravity::Named(GravityPosition::Center)));
}

#[test]
fn gravity_parses_named_and_coordinates() {
    let (opts, _) = TransformOptions::from_query_pairs(&pairs("gravity=face"));
    assert_eq!(opts.gravity, Some(Gravity::Named(GravityPosition::Face)));

    let (opts, _) = TransformOptions::from_query_pairs(&pairs("gravity=0.3,0.7"));
    assert_eq!(opts.gravity, Some(Gravity::Coord { x: 0.3, y: 0.7 }));
}

#[test]
fn draw_overlay_with_conflicting_anchors_drops_later_one() {
    let (mut opts, _) = TransformOptions::from_query_pairs(&pairs(
        r#"draw=[{"url":"https://cdn.example.com/badge.png","left":1,"right":2,"top":4,"bottom":8}]"#,
    ));
    let warnings = opts.sanitize();
    assert_eq!(opts.draw.len(), 1);
    assert_eq!(opts.draw[0].left, Some(1));
    assert_eq!(opts.draw[0].right, None);
    assert_eq!(opts.draw[0].top, Some(4));
    assert_eq!(opts.draw[0].bottom, None);
    assert_eq!(warnings.len(), 2);
}

#[test]
fn draw_overlay_without_url_is_dropped() {
    let mut opts = TransformOptions::default();
    opts.draw.push(imagegate::options::DrawOverlay::default());
    opts.sanitize();
    assert!(opts.draw.is_empty());
}

#[test]
fn draw_opacity_is_clamped_to_unit_interval() {
    let mut opts = TransformOptions::default();
    opts.draw.push(imagegate::options::DrawOverlay {
        url: "https://cdn.example.com/badge.png".into(),
        opacity: Some(1.7),
        ..Default::default()
    });
    opts.validate();
    assert_eq!(opts.draw[0].opacity, Some(1.0));
}

#[test]
fn aspect_parses_both_separator_forms() {
    assert_eq!(
        "16:9".parse::<AspectRatio>().unwrap(),
        AspectRatio { w: 16, h: 9 }
    );
    assert_eq!(
        "16-9".parse::<AspectRatio>().unwrap(),
        AspectRatio { w: 16, h: 9 }
    );
    assert!("16:0".parse::<AspectRatio>().is_err());
}

#[test]
fn aspect_postcondition_completes_missing_height() {
    let (mut opts, _) = TransformOptions::from_query_pairs(&pairs("aspect=16:9&width=800"));
    opts.apply_aspect_postcondition();
    assert_eq!(opts.fit, Some(Fit::Crop));
    assert_eq!(opts.height, Some(450));
}

#[test]
fn aspect_postcondition_translates_focal_into_gravity() {
    let (mut opts, _) =
        TransformOptions::from_query_pairs(&pairs("aspect=1:1&height=500&focal=0.3,0.6"));
    opts.apply_aspect_postcondition();
    assert_eq!(opts.width, Some(500));
    assert_eq!(opts.gravity, Some(Gravity::Coord { x: 0.3, y: 0.6 }));
}

#[test]
fn aspect_postcondition_keeps_pipeline_supplied_fit() {
    let (mut opts, _) = TransformOptions::from_query_pairs(&pairs("aspect=16:9&width=800"));
    opts.fit = Some(Fit::Pad);
    opts.apply_aspect_postcondition();
    assert_eq!(opts.fit, Some(Fit::Pad));
}

#[test]
fn derivative_template_merges_under_url_options() {
    let template = builtin_derivative("thumbnail").unwrap();
    let (mut opts, _) = TransformOptions::from_query_pairs(&pairs("width=64"));
    opts.merge_under(&template);
    // URL width wins over the template's 320.
    assert_eq!(opts.width, Some(64));
    assert_eq!(opts.fit, Some(Fit::ScaleDown));
    assert_eq!(opts.quality, Some(85));
}

#[test]
fn transformer_record_never_carries_semantic_fields() {
    let (mut opts, _) = TransformOptions::from_query_pairs(&pairs(
        "width=400&smart=true&aspect=16:9&derivative=banner&platform=twitter&focal=0.5,0.5",
    ));
    opts.apply_aspect_postcondition();
    let record = opts.to_transformer_record();
    assert!(record.contains_key("width"));
    assert!(record.contains_key("height"));
    for forbidden in [
        "smart",
        "aspect",
        "derivative",
        "platform",
        "focal",
        "content",
        "device",
        "conditions",
        "__autoWidth",
        "auto_width",
    ] {
        assert!(!record.contains_key(forbidden), "{} leaked", forbidden);
    }
}

#[test]
fn condition_parses_operator_and_consequent() {
    let cond = parse_condition("width>800:quality=60;fit=cover").unwrap();
    assert_eq!(cond.then, "quality=60;fit=cover");
    let (then_opts, _) = parse_then_options(&cond.then);
    assert_eq!(then_opts.quality, Some(60));
    assert_eq!(then_opts.fit, Some(Fit::Cover));
}

#[test]
fn condition_without_operator_is_rejected() {
    assert!(parse_condition("width800:quality=60").is_err());
    assert!(parse_condition("width>800").is_err());
}

#[test]
fn matching_condition_merges_consequent_over_options() {
    let (mut opts, _) =
        TransformOptions::from_query_pairs(&pairs("quality=90&condition=width>500:quality=60"));
    let storage = storage_result("image/jpeg", Some(800), Some(600));
    apply_conditions(&mut opts, &storage);
    assert_eq!(opts.quality, Some(60));
    assert!(opts.conditions.is_empty());
}

#[test]
fn non_matching_condition_leaves_options_alone() {
    let (mut opts, _) =
        TransformOptions::from_query_pairs(&pairs("quality=90&condition=width>5000:quality=60"));
    let storage = storage_result("image/jpeg", Some(800), Some(600));
    apply_conditions(&mut opts, &storage);
    assert_eq!(opts.quality, Some(90));
}

#[test]
fn format_condition_compares_source_subtype() {
    let (mut opts, _) =
        TransformOptions::from_query_pairs(&pairs("condition=format=png:quality=95"));
    let storage = storage_result("image/png", Some(100), Some(100));
    apply_conditions(&mut opts, &storage);
    assert_eq!(opts.quality, Some(95));
}

#[test]
fn akamai_resize_translates_mode_names() {
    let (opts, warnings) = TransformOptions::from_query_pairs(&pairs(
        "im.resize=width:400,height:300,mode:fit",
    ));
    assert!(warnings.is_empty());
    assert_eq!(opts.width, Some(400));
    assert_eq!(opts.height, Some(300));
    assert_eq!(opts.fit, Some(Fit::Contain));
}

#[test]
fn akamai_mode_table_is_complete() {
    for (mode, fit) in [
        ("fit", Fit::Contain),
        ("stretch", Fit::ScaleDown),
        ("fill", Fit::Cover),
        ("crop", Fit::Crop),
        ("pad", Fit::Pad),
    ] {
        let (opts, _) = TransformOptions::from_query_pairs(&pairs(&format!(
            "im.resize=width:100,mode:{}",
            mode
        )));
        assert_eq!(opts.fit, Some(fit), "mode {}", mode);
    }
}

#[test]
fn akamai_named_qualities_map_to_numbers() {
    for (name, quality) in [("low", 50u8), ("medium", 75), ("high", 90)] {
        let (opts, _) =
            TransformOptions::from_query_pairs(&pairs(&format!("im.quality={}", name)));
        assert_eq!(opts.quality, Some(quality), "quality {}", name);
    }
}

#[test]
fn cache_key_basis_is_deterministic_and_selective() {
    let (opts, _) = TransformOptions::from_query_pairs(&pairs(
        "width=400&format=webp&quality=80&blur=10&derivative=banner",
    ));
    let basis = cache_key_basis("/cat.jpg", &opts);
    assert_eq!(
        basis,
        "/cat.jpg?derivative=banner&format=webp&quality=80&width=400"
    );
    // Effects do not participate in the key basis.
    assert!(!basis.contains("blur"));
}

#[test]
fn empty_options_record_is_detected() {
    let (opts, _) = TransformOptions::from_query_pairs(&[]);
    assert!(opts.is_empty());
    let (opts, _) = TransformOptions::from_query_pairs(&pairs("width=10"));
    assert!(!opts.is_empty());
}
