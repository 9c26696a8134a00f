use std::{
    ffi::OsStr,
    fs,
    io::Result,
    path::{
        Path,
        PathBuf,
    },
};

fn set_protoc_path() -> Result<()> {
    let binary_path = protoc_bin_vendored::protoc_bin_path()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
    std::env::set_var("PROTOC", binary_path);
    if let Ok(include_path) = protoc_bin_vendored::include_path() {
        std::env::set_var("PROTOC_INCLUDE", include_path);
    }
    Ok(())
}

/// Compiles every `protos/*.proto` in the calling crate and regenerates its
/// `src/lib.rs` so that each package becomes a module.
pub fn pb_build() -> Result<()> {
    set_protoc_path()?;
    println!("cargo:rerun-if-changed=protos");
    let mut paths = vec![];
    let mut packages = vec![];
    for dent in fs::read_dir("protos")? {
        let path = dent?.path();
        if path.extension() == Some(OsStr::new("proto")) {
            let Some(package_name) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            packages.push(package_name.to_owned());
            paths.push(PathBuf::from("protos").join(path.file_name().unwrap_or_default()));
        }
    }
    tonic_build::configure()
        .bytes(["."])
        .compile_protos(&paths, &[PathBuf::from("protos")])?;

    // Sorted so that the generated lib.rs is deterministic.
    packages.sort();

    let mut mods = vec![];
    for m in fs::read_dir("src")? {
        let path = m?.path();
        if path.extension() == Some(OsStr::new("rs")) && path.file_stem() != Some(OsStr::new("lib"))
        {
            if let Some(mod_name) = path.file_stem().and_then(OsStr::to_str) {
                mods.push(mod_name.to_owned());
            }
        }
    }
    mods.sort();

    let mut lib_file_contents = String::new();
    lib_file_contents.push_str("// @generated - do not modify. Modify build.rs instead.\n");
    lib_file_contents.push_str("#![allow(clippy::match_single_binding)]\n");
    for m in mods {
        lib_file_contents.push_str(&format!("pub mod {m};\n"));
    }
    for package_name in packages {
        lib_file_contents.push_str(&format!(
            "pub mod {package_name} {{\n    include!(concat!(env!(\"OUT_DIR\"), \
             \"/{package_name}.rs\"));\n}}\n",
        ));
    }

    let out_file = Path::new("src/lib.rs");
    if fs::read_to_string(out_file)? != lib_file_contents {
        fs::write(out_file, lib_file_contents)?;
    }

    Ok(())
}
