/// Scenarios against a real jq engine build.
///
/// These need an Emscripten build of the jq wrapper module. Point
/// `JQWASM_MODULE` at the `.wasm` file and run:
/// `cargo test -p jqwasm-runtime --test jq_scenarios -- --include-ignored`
use jqwasm_runtime::{FilterError, Jq, JqWasmConfig, ModuleLoader, WasmEngine};

fn load_jq() -> Jq<WasmEngine> {
    let config = JqWasmConfig::default();
    let loader = ModuleLoader::new(None).expect("loader");
    let module = loader
        .load(|name| config.locate_file(name))
        .expect("set JQWASM_MODULE to a jq engine build");
    Jq::new(loader.instantiate(&module).expect("instantiate"))
}

#[test]
#[ignore = "requires a jq engine build in JQWASM_MODULE"]
fn field_access() {
    let mut jq = load_jq();
    assert_eq!(jq.run(r#"{"a":1}"#, ".a").unwrap(), "1");
}

#[test]
#[ignore = "requires a jq engine build in JQWASM_MODULE"]
fn multiple_outputs() {
    let mut jq = load_jq();
    assert_eq!(jq.run(r#"{"a":[1,2,3]}"#, ".a[] | . * 2").unwrap(), "[2,4,6]");
}

#[test]
#[ignore = "requires a jq engine build in JQWASM_MODULE"]
fn missing_path_is_null() {
    let mut jq = load_jq();
    assert_eq!(jq.run("{}", ".a.b.c").unwrap(), "null");
}

#[test]
#[ignore = "requires a jq engine build in JQWASM_MODULE"]
fn syntax_error() {
    let mut jq = load_jq();
    assert!(!jq.is_valid_filter(".a +").unwrap());
    let err = jq.run(r#"{"a":1}"#, ".a +").unwrap_err();
    assert!(matches!(err, FilterError::Filter(_)));
    assert!(!err.message().is_empty());
}

#[test]
#[ignore = "requires a jq engine build in JQWASM_MODULE"]
fn malformed_input() {
    let mut jq = load_jq();
    let err = jq.run("not json", ".").unwrap_err();
    assert!(matches!(err, FilterError::InvalidInput(_)), "got {err:?}");
}

#[test]
#[ignore = "requires a jq engine build in JQWASM_MODULE"]
fn version_is_stable() {
    let mut jq = load_jq();
    let version = jq.engine_version().unwrap();
    assert!(!version.is_empty());
    jq.run("{}", ".").unwrap();
    assert_eq!(jq.engine_version().unwrap(), version);
}

#[test]
#[ignore = "requires a jq engine build in JQWASM_MODULE"]
fn no_stale_error_after_failure() {
    let mut jq = load_jq();
    let failed = jq.run("{}", ".a +").unwrap_err().message();
    let ok = jq.run(r#"{"a":"b"}"#, ".a").unwrap();
    assert_eq!(ok, r#""b""#);
    assert_ne!(ok, failed);
    assert_eq!(jq.stats().outstanding(), 0);
}
