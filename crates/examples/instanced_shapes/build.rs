use std::io;
use std::process::{Command, Output};

fn main() -> io::Result<()> {
    // Only rerun when the shader sources change
    println!("cargo:rerun-if-changed=shaders");

    std::fs::create_dir_all("../../../spv")?;

    for entry in std::fs::read_dir("shaders")? {
        let entry = entry?;

        if entry.file_type()?.is_file() {
            let in_path = entry.path();
            let out_path = format!("../../../spv/{}.spv", entry.file_name().to_string_lossy());
            let stat = Command::new("glslc")
                .arg(&in_path)
                .args(["--target-env=vulkan1.2", "-O", "-o"])
                .arg(&out_path)
                .output();

            handle_program_result(&in_path.to_string_lossy(), stat);
        }
    }

    Ok(())
}

fn handle_program_result(shader: &str, result: io::Result<Output>) {
    match result {
        Ok(output) => {
            if output.status.success() {
                println!("Compiled {shader}");
            } else {
                eprintln!("Shader compilation failed. Status: {}", output.status);
                eprint!(
                    "stdout: {}",
                    String::from_utf8(output.stdout)
                        .unwrap_or_else(|_| "Failed to print program stdout".to_string())
                );
                eprint!(
                    "stderr: {}",
                    String::from_utf8(output.stderr)
                        .unwrap_or_else(|_| "Failed to print program stderr".to_string())
                );
                panic!("Failed to compile {shader}. Status: {}", output.status);
            }
        }
        Err(error) => {
            panic!("Failed to run glslc on {shader}. Cause: {}", error);
        }
    }
}
