fn main() {
    let crate_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(_) => return,
    };

    println!("cargo:rerun-if-changed=src/capi.rs");

    let enum_cfg = cbindgen::EnumConfig {
        rename_variants: Some(cbindgen::RenameRule::ScreamingSnakeCase),
        prefix_with_name: true,
        ..cbindgen::EnumConfig::default()
    };

    let ccfg = cbindgen::Config {
        enumeration: enum_cfg,
        ..cbindgen::Config::default()
    };

    // Generate the C header for the binding layer
    let bindings = cbindgen::Builder::new()
        .with_config(ccfg)
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("SMU_H")
        .rename_item("Session", "smu_session_t")
        .rename_item("SmuArgs", "smu_args_t")
        .rename_item("SmuBackend", "smu_backend")
        .rename_item("Sample", "smu_sample_t")
        .generate();

    match bindings {
        Ok(bindings) => {
            bindings.write_to_file("smu.h");
        }
        Err(e) => println!("cargo:warning=failed to generate smu.h: {}", e),
    }
}
