//! 目录打包模块
//!
//! 将目录递归打包为临时 zip 文件，供整目录下载使用。

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use tempfile::{NamedTempFile, TempPath};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ShareError;

const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// 将目录打包为临时 zip 文件
///
/// 归档内的条目名相对于目标目录的父目录，因此顶层条目就是目录名本身。
/// 只收录普通文件，符号链接不跟随。
///
/// # Returns
/// 临时文件路径，`TempPath` 被 drop 时文件随之删除；
/// 任何 IO 错误都会删除已写入的部分归档并返回 `ServerError`。
pub fn build_zip(directory: &Path) -> Result<TempPath, ShareError> {
    if !directory.is_dir() {
        return Err(ShareError::NotFound(format!(
            "Not a directory: {}",
            directory.display()
        )));
    }

    let temp = tempfile::Builder::new()
        .prefix("dirshare-")
        .suffix(".zip")
        .tempfile()
        .map_err(|e| ShareError::server(format!("Failed to create temp archive: {}", e)))?;

    // 失败时 temp 在这里被 drop，部分归档随之删除
    write_archive(&temp, directory)
        .map_err(|e| ShareError::server(format!("Failed to build archive: {}", e)))?;

    Ok(temp.into_temp_path())
}

fn write_archive(temp: &NamedTempFile, directory: &Path) -> io::Result<()> {
    let base = directory.parent().unwrap_or(directory);
    let top = directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());

    let mut zip = ZipWriter::new(BufWriter::new(temp.as_file().try_clone()?));

    for entry in WalkDir::new(directory).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = archive_name(entry.path(), base, directory, &top);
        let size = entry.metadata().map_err(io::Error::from)?.len();
        zip.start_file(name, entry_options(size)).map_err(zip_error)?;
        let mut source = File::open(entry.path())?;
        io::copy(&mut source, &mut zip)?;
    }

    let mut writer = zip.finish().map_err(zip_error)?;
    io::Write::flush(&mut writer)?;
    Ok(())
}

fn needs_zip64(size: u64) -> bool {
    size >= ZIP64_THRESHOLD
}

/// 单个条目的写入选项，超过 4 GiB 的条目启用 Zip64
fn entry_options(size: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(needs_zip64(size))
}

/// 计算条目在归档内的名称（始终使用 `/` 分隔）
fn archive_name(path: &Path, base: &Path, directory: &Path, top: &str) -> String {
    // 共享根目录没有父目录时退化为以目录名为顶层
    let relative = if base == directory {
        let inner = path.strip_prefix(directory).unwrap_or(path);
        Path::new(top).join(inner)
    } else {
        path.strip_prefix(base).unwrap_or(path).to_path_buf()
    };

    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}
