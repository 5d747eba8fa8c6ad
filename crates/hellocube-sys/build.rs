// Build-time shader compilation uses glslc (Vulkan SDK) targeting vulkan1.3.
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const SHADERS: [(&str, &str); 2] = [
    ("cube.vert.glsl", "vertex"),
    ("cube.frag.glsl", "fragment"),
];

fn main() {
    let Ok(dest) = env::var("OUT_DIR") else {
        println!("cargo:warning=OUT_DIR not set; skipping shader compilation");
        return;
    };
    let spirv_dir = Path::new(&dest).join("spirv");
    println!("cargo:rustc-env=HELLOCUBE_SPIRV_DIR={}", spirv_dir.display());

    let shader_dir = Path::new("shaders");
    for (filename, _) in &SHADERS {
        println!("cargo:rerun-if-changed=shaders/{filename}");
    }
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    // Without glslc the binary still builds; point HELLOCUBE_SHADER_DIR at prebuilt SPIR-V.
    let Some(glslc) = find_glslc() else {
        println!(
            "cargo:warning=glslc not found; shaders not compiled. Install the Vulkan SDK \
             or set HELLOCUBE_SHADER_DIR at runtime."
        );
        return;
    };

    if let Err(e) = fs::create_dir_all(&spirv_dir) {
        println!("cargo:warning=cannot create {}: {e}", spirv_dir.display());
        return;
    }

    for (filename, stage) in &SHADERS {
        let src_path = shader_dir.join(filename);
        let spv_path = spirv_dir.join(filename.replace(".glsl", ".spv"));
        compile_shader(&glslc, &src_path, &spv_path, stage, filename);
    }
}

/// Compile a single shader file to SPIR-V.
fn compile_shader(glslc: &Path, src_path: &Path, spv_path: &Path, stage: &str, filename: &str) -> bool {
    let output = Command::new(glslc)
        .arg(format!("-fshader-stage={stage}"))
        .args(["--target-env=vulkan1.3", "-O", "-o"])
        .arg(spv_path)
        .arg(src_path)
        .output();

    match output {
        Ok(result) if result.status.success() => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if !stderr.is_empty() {
                println!("cargo:warning=glslc {filename}: {stderr}");
            }
            true
        }
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            println!("cargo:warning=glslc FAILED {filename}: {stderr}");
            false
        }
        Err(e) => {
            println!("cargo:warning=glslc: failed to run for {filename}: {e}");
            false
        }
    }
}

/// Find glslc binary: check PATH, then VULKAN_SDK.
fn find_glslc() -> Option<PathBuf> {
    if let Ok(output) = Command::new("glslc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("glslc"));
        }
    }

    let sdk = env::var("VULKAN_SDK").ok()?;
    [
        PathBuf::from(&sdk).join("Bin").join("glslc.exe"),
        PathBuf::from(&sdk).join("bin").join("glslc"),
    ]
    .into_iter()
    .find(|path| path.exists())
}
