//! SPIR-V loading.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{RenderError, Result};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Vertex shader of the cube pipeline.
pub const CUBE_VERTEX_SHADER: &str = "cube.vert";
/// Fragment shader of the cube pipeline.
pub const CUBE_FRAGMENT_SHADER: &str = "cube.frag";

/// Provides compiled shader bytecode by name.
pub trait ShaderSource {
    fn load(&self, name: &str) -> Result<Vec<u32>>;
}

/// Reads `<dir>/<name>.spv`.
#[derive(Debug, Clone)]
pub struct ShaderDir {
    dir: PathBuf,
}

impl ShaderDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.spv", name))
    }
}

impl ShaderSource for ShaderDir {
    fn load(&self, name: &str) -> Result<Vec<u32>> {
        let path = self.path_for(name);
        let shader_error = |reason: String| RenderError::ShaderLoad {
            name: name.to_string(),
            reason,
        };

        let mut file = File::open(&path)
            .map_err(|e| shader_error(format!("{}: {}", path.display(), e)))?;
        let words = ash::util::read_spv(&mut file)
            .map_err(|e| shader_error(format!("{}: {}", path.display(), e)))?;

        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(shader_error(format!("{}: not a SPIR-V module", path.display())));
        }
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hellocube-shader-{}-{}", test, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_loads_spirv_words() {
        let dir = scratch_dir("ok");
        let module = [SPIRV_MAGIC, 0x0001_0600, 0, 1, 0];
        fs::write(dir.join("cube.vert.spv"), words_to_bytes(&module)).unwrap();

        let words = ShaderDir::new(&dir).load(CUBE_VERTEX_SHADER).unwrap();
        assert_eq!(words, module);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_file_names_the_shader() {
        let dir = scratch_dir("missing");
        let err = ShaderDir::new(&dir).load(CUBE_FRAGMENT_SHADER).unwrap_err();
        match err {
            RenderError::ShaderLoad { name, .. } => assert_eq!(name, "cube.frag"),
            other => panic!("unexpected error: {:?}", other),
        }
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_rejects_truncated_and_foreign_files() {
        let dir = scratch_dir("bad");
        fs::write(dir.join("odd.spv"), [3u8, 2, 35, 7, 1]).unwrap();
        fs::write(dir.join("text.spv"), b"void main() {}\n\0").unwrap();

        let source = ShaderDir::new(&dir);
        assert!(matches!(source.load("odd"), Err(RenderError::ShaderLoad { .. })));
        assert!(matches!(source.load("text"), Err(RenderError::ShaderLoad { .. })));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_path_layout() {
        let source = ShaderDir::new("/opt/spv");
        assert_eq!(source.path_for("cube.vert"), PathBuf::from("/opt/spv/cube.vert.spv"));
    }
}
