use jsvm_runtime::sourcemap::{CallSite, SourceMap, rewrite_stack};

// Two-module bundle:
//   line 0 -> src/util.ts 0:0, col 9 -> src/util.ts 1:2
//   line 1 -> src/main.ts 4:4
const BUNDLE_MAP: &str = r#"{
    "version": 3,
    "file": "bundle.js",
    "sources": ["src/util.ts", "src/main.ts"],
    "names": ["helper", "main"],
    "mappings": "AAAA,SACE;ACGE"
}"#;

#[test]
fn test_lookup_in_bundle() {
    let map = SourceMap::parse(BUNDLE_MAP).unwrap();

    assert_eq!(map.mappings().len(), 3);
    assert_eq!(map.find_entry(0, 3).unwrap().to_location_string(), "src/util.ts:1:1");
    assert_eq!(map.find_entry(0, 12).unwrap().to_location_string(), "src/util.ts:2:3");
    assert_eq!(map.find_entry(1, 0).unwrap().to_location_string(), "src/main.ts:5:5");
}

#[test]
fn test_rewrite_bundle_stack() {
    let frames = vec![
        CallSite {
            function_name: Some("helper".into()),
            line: 1,
            column: 10,
            raw: "helper (bundle.js:1:10)".into(),
            ..Default::default()
        },
        CallSite {
            method_name: Some("main".into()),
            type_name: Some("App".into()),
            line: 2,
            column: 1,
            raw: "App.main (bundle.js:2:1)".into(),
            ..Default::default()
        },
    ];

    let stack = rewrite_stack("Error: failed", &frames, BUNDLE_MAP);

    assert_eq!(
        stack,
        "Error: failed\n    at helper (src/util.ts:2:3)\n    at App.main (src/main.ts:5:5)"
    );
}
