// Build script to compile GLSL shaders to SPIR-V
//
// The runtime loads pre-compiled binaries; this only produces them when
// glslc (Vulkan SDK) is installed. Without it the .spv files must be built
// by hand and a warning is printed.

use std::path::Path;
use std::process::Command;

const SHADERS: [&str; 2] = ["shaders/display.vert", "shaders/display.frag"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    for input in SHADERS {
        compile_shader(input, &format!("{}.spv", input));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    if !input_path.exists() {
        return;
    }

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(Path::new(output))
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}); compile manually: glslc {} -o {}", e, input, output);
        }
    }
}
