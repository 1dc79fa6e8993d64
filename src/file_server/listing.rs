//! 目录列表页面生成
//!
//! 为目录生成自包含的 HTML 页面：面包屑导航、前端搜索过滤、文件行、上传与新建目录表单。

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};
use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::error::ShareError;
use crate::log_broker::LogBroker;

/// 列表中的一行，仅在请求期间存在
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    /// 仅对文件有意义
    pub size_bytes: u64,
    pub modified: Option<DateTime<Local>>,
    /// 打开/进入链接（相对当前目录，目录带结尾 `/`）
    pub open_link: String,
    /// 下载链接（文件直接下载，目录打包为 zip）
    pub download_link: String,
}

/// 扩展名到图标的固定映射
const ICONS: &[(&str, &str)] = &[
    ("txt", "📄"),
    ("md", "📄"),
    ("pdf", "📕"),
    ("doc", "📘"),
    ("docx", "📘"),
    ("xls", "📗"),
    ("xlsx", "📗"),
    ("jpg", "🖼️"),
    ("jpeg", "🖼️"),
    ("png", "🖼️"),
    ("gif", "🖼️"),
    ("webp", "🖼️"),
    ("mp3", "🎵"),
    ("wav", "🎵"),
    ("flac", "🎵"),
    ("mp4", "🎬"),
    ("avi", "🎬"),
    ("mkv", "🎬"),
    ("zip", "📦"),
    ("rar", "📦"),
    ("7z", "📦"),
    ("apk", "📱"),
    ("py", "🐍"),
    ("rs", "🦀"),
    ("js", "📜"),
    ("html", "🌐"),
    ("css", "🎨"),
];

const FOLDER_ICON: &str = "📁";
const DEFAULT_ICON: &str = "📄";

/// 根据扩展名选择图标
pub fn file_icon(name: &str) -> &'static str {
    let ext = match Path::new(name).extension() {
        Some(ext) => ext.to_string_lossy().to_lowercase(),
        None => return DEFAULT_ICON,
    };
    ICONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, icon)| *icon)
        .unwrap_or(DEFAULT_ICON)
}

/// 人类可读的文件大小
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut value = size as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} TB", value)
}

/// 百分号编码一个虚拟路径（逐段编码，保留 `/`）
pub fn encode_path(virtual_path: &str) -> String {
    virtual_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 根目录下与固定路由同名的条目
const RESERVED_ROOT_NAMES: [&str; 2] = ["download", "favicon.ico"];

/// 编码根目录下的一段名称
///
/// 与固定路由同名时再编码首字符（`download` → `%64ownload`），
/// 使浏览链接落到目录浏览而不是下载或图标路由；路由按原始路径匹配，浏览时再解码。
pub fn encode_root_segment(name: &str) -> String {
    let encoded = urlencoding::encode(name).into_owned();
    if !RESERVED_ROOT_NAMES.contains(&encoded.as_str()) {
        return encoded;
    }

    let mut chars = encoded.chars();
    match chars.next() {
        Some(first) => format!("%{:02X}{}", first as u32, chars.as_str()),
        None => encoded,
    }
}

/// 目录浏览地址：`/<编码后的虚拟路径>/`，根目录为 `/`
pub fn listing_href(virtual_dir: &str) -> String {
    let mut href = String::from("/");
    for (index, segment) in virtual_dir.split('/').filter(|s| !s.is_empty()).enumerate() {
        if index == 0 {
            href.push_str(&encode_root_segment(segment));
        } else {
            href.push_str(&urlencoding::encode(segment));
        }
        href.push('/');
    }
    href
}

/// 读取目录下的直接子项
///
/// 目录在前，其次按名称不区分大小写排序；
/// 单个条目 stat 失败时记录日志并跳过，不中断整个列表。
pub fn collect_entries(
    directory: &Path,
    virtual_dir: &str,
    log: &LogBroker,
) -> Result<Vec<DirectoryEntry>, ShareError> {
    let read_dir = fs::read_dir(directory)
        .map_err(|e| ShareError::NotFound(format!("Cannot read directory: {}", e)))?;

    let mut entries = Vec::new();
    for item in read_dir {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                log.warning(format!("Skipping unreadable entry in /{}: {}", virtual_dir, e));
                continue;
            }
        };

        let name = item.file_name().to_string_lossy().into_owned();
        // 跟随符号链接取目标的元数据
        let metadata = match fs::metadata(item.path()) {
            Ok(metadata) => metadata,
            Err(e) => {
                log.warning(format!("Skipping {}: {}", name, e));
                continue;
            }
        };

        let is_directory = metadata.is_dir();
        let relative = if virtual_dir.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", virtual_dir, name)
        };

        let mut open_link = if virtual_dir.is_empty() {
            encode_root_segment(&name)
        } else {
            urlencoding::encode(&name).into_owned()
        };
        if is_directory {
            open_link.push('/');
        }

        entries.push(DirectoryEntry {
            download_link: format!("/download/{}", encode_path(&relative)),
            open_link,
            size_bytes: if is_directory { 0 } else { metadata.len() },
            modified: metadata.modified().ok().map(DateTime::<Local>::from),
            is_directory,
            name,
        });
    }

    entries.sort_by(compare_entries);
    Ok(entries)
}

fn compare_entries(a: &DirectoryEntry, b: &DirectoryEntry) -> Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
}

/// 面包屑：按 `/` 拆分虚拟路径，每个前缀一个链接
pub fn render_breadcrumb(virtual_dir: &str) -> String {
    let mut html = String::new();
    let mut current = String::new();

    for (index, part) in virtual_dir.split('/').filter(|p| !p.is_empty()).enumerate() {
        current.push('/');
        if index == 0 {
            current.push_str(&encode_root_segment(part));
        } else {
            current.push_str(&urlencoding::encode(part));
        }
        html.push_str(&format!(
            " <span>/</span> <a href=\"{}/\">{}</a>",
            encode_double_quoted_attribute(&current),
            encode_text(part)
        ));
    }

    html
}

fn render_rows(entries: &[DirectoryEntry]) -> String {
    if entries.is_empty() {
        return "<p class=\"empty\">No files found</p>".to_string();
    }

    let mut html = String::new();
    for entry in entries {
        let (icon, display_name, size, button) = if entry.is_directory {
            (
                FOLDER_ICON,
                format!("{}/", entry.name),
                "-".to_string(),
                "<a href=\"{link}\" class=\"btn zip\" title=\"Download as ZIP\">📦 ZIP</a>",
            )
        } else {
            (
                file_icon(&entry.name),
                entry.name.clone(),
                format_size(entry.size_bytes),
                "<a href=\"{link}\" class=\"btn\" title=\"Download file\">⬇️ Download</a>",
            )
        };

        let modified = entry
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        let button = button.replace(
            "{link}",
            &encode_double_quoted_attribute(&entry.download_link),
        );

        html.push_str(&format!(
            "<div class=\"item\">\n  <div class=\"icon\">{icon}</div>\n  <div class=\"info\">\n    <a href=\"{href}\" class=\"name\">{name}</a>\n    <div class=\"meta\">{size} • {modified}</div>\n  </div>\n  <div class=\"actions\">{button}</div>\n</div>\n",
            icon = icon,
            href = encode_double_quoted_attribute(&entry.open_link),
            name = encode_text(&display_name),
            size = size,
            modified = modified,
            button = button,
        ));
    }

    html
}

const STYLE: &str = r#"
* { margin: 0; padding: 0; box-sizing: border-box; }
body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #eef0fb; padding: 20px; }
.container { max-width: 1100px; margin: 0 auto; background: #fff; border-radius: 14px; box-shadow: 0 12px 40px rgba(0,0,0,.15); overflow: hidden; }
.header { background: #4F46E5; color: #fff; padding: 24px; text-align: center; }
.header h1 { font-size: 1.8em; font-weight: 600; }
.breadcrumb, .search, .tools { background: #F9FAFB; padding: 14px 24px; border-bottom: 1px solid #E5E7EB; word-break: break-word; }
.breadcrumb a { color: #4F46E5; text-decoration: none; margin: 0 4px; }
.search input { width: 100%; padding: 10px 16px; border: 2px solid #E5E7EB; border-radius: 8px; font-size: 14px; }
.tools form { display: inline-flex; gap: 8px; margin: 4px 12px 4px 0; align-items: center; }
.list { padding: 16px; }
.item { display: flex; align-items: flex-start; gap: 10px; padding: 12px; border-bottom: 1px solid #E5E7EB; }
.item:hover { background: #F9FAFB; }
.icon { font-size: 26px; min-width: 28px; }
.info { flex: 1 1 auto; min-width: 0; }
.name { color: #111827; text-decoration: none; font-weight: 500; overflow-wrap: anywhere; }
.meta { color: #6B7280; font-size: .85em; margin-top: 4px; }
.actions { flex-shrink: 0; }
.btn { background: #10B981; color: #fff; padding: 7px 12px; border-radius: 6px; text-decoration: none; font-size: .85em; white-space: nowrap; border: none; cursor: pointer; }
.btn.zip { background: #F59E0B; }
.empty { text-align: center; padding: 40px; color: #6B7280; }
@media (max-width: 600px) { body { padding: 0; } .container { border-radius: 0; } }
"#;

const SCRIPT: &str = r#"
function filterFiles() {
    const filter = document.getElementById('search').value.toUpperCase();
    document.querySelectorAll('.item').forEach(function (item) {
        const name = item.querySelector('.name').textContent;
        item.style.display = name.toUpperCase().indexOf(filter) > -1 ? '' : 'none';
    });
}
"#;

/// 生成完整的目录列表页面
pub fn render_listing(virtual_dir: &str, entries: &[DirectoryEntry]) -> String {
    let display_path = format!("/{}", virtual_dir);
    let display_path = if virtual_dir.is_empty() {
        display_path
    } else {
        format!("{}/", display_path)
    };

    let target = if virtual_dir.is_empty() {
        String::new()
    } else {
        format!("?dir={}", urlencoding::encode(virtual_dir))
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>dirshare - {title}</title>
<style>{style}</style>
</head>
<body>
<div class="container">
  <div class="header">
    <h1>📁 dirshare</h1>
    <p>{title}</p>
  </div>
  <div class="breadcrumb">
    <a href="/">🏠 Home</a>{breadcrumb}
  </div>
  <div class="tools">
    <form action="/upload{target}" method="post" enctype="multipart/form-data">
      <input type="file" name="file" required>
      <button class="btn" type="submit">⬆️ Upload</button>
    </form>
    <form action="/create_directory{target}" method="post">
      <input type="text" name="dirname" placeholder="New folder" required>
      <button class="btn zip" type="submit">➕ Create</button>
    </form>
  </div>
  <div class="search">
    <input type="text" id="search" placeholder="🔍 Search files..." onkeyup="filterFiles()">
  </div>
  <div class="list" id="fileList">
{rows}
  </div>
</div>
<script>{script}</script>
</body>
</html>
"#,
        title = encode_text(&display_path),
        style = STYLE,
        breadcrumb = render_breadcrumb(virtual_dir),
        target = encode_double_quoted_attribute(&target),
        rows = render_rows(entries),
        script = SCRIPT,
    )
}
