//! 产物收集：按glob匹配工作目录下的文件，计算SHA-256，可选复制到产物目录

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use taskfleet_core::models::ArtifactRef;

/// 阻塞操作，调用方应放在 `spawn_blocking` 中执行
pub fn collect_artifacts(
    working_dir: &Path,
    patterns: &[String],
    artifact_root: Option<&Path>,
    execution_id: &str,
) -> Vec<ArtifactRef> {
    let mut artifacts: Vec<ArtifactRef> = Vec::new();
    for pattern in patterns {
        let full = working_dir.join(pattern);
        let Some(full) = full.to_str() else {
            warn!("产物模式不是合法的UTF-8路径: {pattern}");
            continue;
        };
        let paths = match glob::glob(full) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("产物模式 {pattern} 无效: {e}");
                continue;
            }
        };
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("读取产物路径失败: {e}");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            // 不允许通过 `..` 逃出工作目录
            let Ok(relative) = path.strip_prefix(working_dir) else {
                continue;
            };
            if relative.components().any(|c| matches!(c, Component::ParentDir)) {
                warn!("产物路径 {} 超出工作目录，跳过", path.display());
                continue;
            }
            let relative_str = relative.to_string_lossy().to_string();
            if artifacts.iter().any(|a| a.path == relative_str) {
                continue;
            }
            match describe(&path, relative, artifact_root, execution_id) {
                Ok(artifact) => {
                    debug!("收集产物 {} ({} 字节)", artifact.path, artifact.size_bytes);
                    artifacts.push(artifact);
                }
                Err(e) => warn!("处理产物 {} 失败: {e}", path.display()),
            }
        }
    }
    artifacts
}

fn describe(
    path: &Path,
    relative: &Path,
    artifact_root: Option<&Path>,
    execution_id: &str,
) -> io::Result<ArtifactRef> {
    let (sha256, size_bytes) = sha256_file(path)?;
    let stored_path = match artifact_root {
        Some(root) => {
            let target: PathBuf = root.join(execution_id).join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(path, &target)?;
            Some(target)
        }
        None => None,
    };
    Ok(ArtifactRef {
        path: relative.to_string_lossy().to_string(),
        stored_path,
        size_bytes,
        sha256,
    })
}

pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}
