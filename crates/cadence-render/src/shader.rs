// SPDX-License-Identifier: CEPL-1.0
//! Precompiled SPIR-V lookup. Files are named `{name}.{stage}.spv`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::gpu::ShaderStage;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("failed to read shader {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shader {path} is {len} bytes, not a whole number of SPIR-V words")]
    Misaligned { path: PathBuf, len: usize },
    #[error("shader {path} does not start with the SPIR-V magic number")]
    BadMagic { path: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderBinary {
    pub name: String,
    pub stage: ShaderStage,
    pub words: Vec<u32>,
}

fn stage_suffix(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vert",
        ShaderStage::Fragment => "frag",
    }
}

/// Decodes little-endian SPIR-V, accepting a byte-swapped magic number.
pub fn decode_spirv(path: &Path, bytes: &[u8]) -> Result<Vec<u32>, ShaderError> {
    if bytes.len() % 4 != 0 || bytes.is_empty() {
        return Err(ShaderError::Misaligned {
            path: path.to_path_buf(),
            len: bytes.len(),
        });
    }
    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    match words[0] {
        SPIRV_MAGIC => {}
        m if m.swap_bytes() == SPIRV_MAGIC => {
            for w in &mut words {
                *w = w.swap_bytes();
            }
        }
        _ => {
            return Err(ShaderError::BadMagic {
                path: path.to_path_buf(),
            })
        }
    }
    Ok(words)
}

#[derive(Clone, Debug)]
pub struct ShaderLibrary {
    dir: PathBuf,
}

impl ShaderLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str, stage: ShaderStage) -> PathBuf {
        self.dir.join(format!("{name}.{}.spv", stage_suffix(stage)))
    }

    pub fn load(&self, name: &str, stage: ShaderStage) -> Result<ShaderBinary, ShaderError> {
        let path = self.path(name, stage);
        let bytes = std::fs::read(&path).map_err(|source| ShaderError::Io {
            path: path.clone(),
            source,
        })?;
        let words = decode_spirv(&path, &bytes)?;
        debug!(path = %path.display(), words = words.len(), "shader loaded");
        Ok(ShaderBinary {
            name: name.to_owned(),
            stage,
            words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn path_uses_stage_suffix() {
        let lib = ShaderLibrary::new("shaders");
        assert_eq!(
            lib.path("mesh", ShaderStage::Vertex),
            Path::new("shaders").join("mesh.vert.spv")
        );
        assert_eq!(
            lib.path("mesh", ShaderStage::Fragment),
            Path::new("shaders").join("mesh.frag.spv")
        );
    }

    #[test]
    fn decode_checks_alignment_and_magic() {
        let p = Path::new("x.spv");
        assert!(matches!(
            decode_spirv(p, &[1, 2, 3]),
            Err(ShaderError::Misaligned { len: 3, .. })
        ));
        assert!(matches!(
            decode_spirv(p, &spirv_bytes(&[0xdead_beef])),
            Err(ShaderError::BadMagic { .. })
        ));
        assert_eq!(
            decode_spirv(p, &spirv_bytes(&[SPIRV_MAGIC, 0x0001_0000])).unwrap(),
            vec![SPIRV_MAGIC, 0x0001_0000]
        );
        assert_eq!(
            decode_spirv(p, &spirv_bytes(&[SPIRV_MAGIC.swap_bytes(), 0x0000_0100])).unwrap(),
            vec![SPIRV_MAGIC, 0x0001_0000]
        );
    }

    #[test]
    fn load_reads_from_directory() {
        let dir = std::env::temp_dir().join(format!("cadence-shader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tri.frag.spv"), spirv_bytes(&[SPIRV_MAGIC, 7])).unwrap();

        let lib = ShaderLibrary::new(&dir);
        let shader = lib.load("tri", ShaderStage::Fragment).unwrap();
        assert_eq!(shader.words, vec![SPIRV_MAGIC, 7]);
        assert!(matches!(
            lib.load("tri", ShaderStage::Vertex),
            Err(ShaderError::Io { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
