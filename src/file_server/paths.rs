//! 路径解析模块
//!
//! 将客户端提交的相对路径解析为共享根目录下的绝对路径。
//! 这是防止目录穿越的唯一安全边界，任何由请求触发的文件系统读写之前都必须经过这里。

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::ShareError;

/// 路径解析器
///
/// 根目录在构造时规范化一次，之后所有请求都以它为基准。
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// 以给定目录为根创建解析器
    pub fn new(root: &Path) -> Result<Self, ShareError> {
        let root = root
            .canonicalize()
            .map_err(|e| ShareError::InvalidDirectory(format!("{}: {}", root.display(), e)))?;
        if !root.is_dir() {
            return Err(ShareError::InvalidDirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// 规范化后的根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析客户端路径（仍为百分号编码形式）
    ///
    /// # Errors
    /// - `AccessDenied`: 以 `/` 开头、含 `..` 段，或规范化后落在根目录之外
    /// - `NotFound`: 目标不存在
    /// - `BadRequest`: 解码后不是合法 UTF-8 或包含 NUL
    pub fn resolve(&self, request: &str) -> Result<PathBuf, ShareError> {
        let decoded = urlencoding::decode(request)
            .map_err(|_| ShareError::BadRequest(format!("Malformed path: {}", request)))?;

        self.resolve_decoded(&decoded)
    }

    /// 解析已解码的相对路径（如表单或查询参数中的值）
    pub fn resolve_decoded(&self, relative: &str) -> Result<PathBuf, ShareError> {
        check_relative(relative)?;

        let candidate = self.root.join(relative);
        let canonical = match candidate.canonicalize() {
            Ok(path) => path,
            // 文件被当作目录前缀（`a.txt/x`）同样视为不存在
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
            {
                return Err(ShareError::NotFound(format!(
                    "File or folder not found: {}",
                    relative
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if !canonical.starts_with(&self.root) {
            return Err(ShareError::AccessDenied(relative.to_string()));
        }

        Ok(canonical)
    }

    /// 绝对路径相对于根目录的虚拟路径（`/` 分隔，根目录为空串）
    pub fn virtual_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Some(parts.join("/"))
    }
}

/// 词法检查：拒绝绝对路径和 `..` 段
fn check_relative(request: &str) -> Result<(), ShareError> {
    if request.contains('\0') {
        return Err(ShareError::BadRequest("Path contains NUL byte".to_string()));
    }

    if request.starts_with('/') || request.starts_with('\\') {
        return Err(ShareError::AccessDenied(request.to_string()));
    }

    if request.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(ShareError::AccessDenied(request.to_string()));
    }

    // Windows 盘符等前缀
    let has_prefix = Path::new(request)
        .components()
        .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir));
    if has_prefix {
        return Err(ShareError::AccessDenied(request.to_string()));
    }

    Ok(())
}

/// 将客户端提交的文件名裁剪为纯文件名
///
/// 丢弃客户端附带的任何目录部分（`/` 与 `\` 都视为分隔符）。
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }
    Some(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, PathResolver) {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("x.txt"), "x").unwrap();
        fs::write(dir.path().join("a..b.txt"), "dots").unwrap();
        let resolver = PathResolver::new(dir.path()).unwrap();
        (dir, resolver)
    }

    #[test]
    fn test_resolve_file_and_directory() {
        let (_dir, resolver) = setup();

        let file = resolver.resolve("a.txt").unwrap();
        assert_eq!(file, resolver.root().join("a.txt"));

        let sub = resolver.resolve("sub/").unwrap();
        assert_eq!(sub, resolver.root().join("sub"));

        let nested = resolver.resolve("sub/x.txt").unwrap();
        assert!(nested.ends_with("sub/x.txt"));
    }

    #[test]
    fn test_empty_request_resolves_to_root() {
        let (_dir, resolver) = setup();
        assert_eq!(resolver.resolve("").unwrap(), resolver.root());
        assert_eq!(resolver.resolve("./").unwrap(), resolver.root());
    }

    #[test]
    fn test_percent_decoding() {
        let (dir, resolver) = setup();
        fs::write(dir.path().join("my file.txt"), "spaced").unwrap();

        let resolved = resolver.resolve("my%20file.txt").unwrap();
        assert!(resolved.ends_with("my file.txt"));
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, resolver) = setup();

        for request in ["../etc/passwd", "sub/../../x", "..", "sub/..", "%2e%2e/secret", "..%2Fa.txt"] {
            let result = resolver.resolve(request);
            assert!(
                matches!(result, Err(ShareError::AccessDenied(_))),
                "{} should be denied, got {:?}",
                request,
                result
            );
        }
    }

    #[test]
    fn test_rejects_absolute() {
        let (_dir, resolver) = setup();
        assert!(matches!(
            resolver.resolve("/etc/passwd"),
            Err(ShareError::AccessDenied(_))
        ));
        assert!(matches!(
            resolver.resolve("%2Fetc%2Fpasswd"),
            Err(ShareError::AccessDenied(_))
        ));
        assert!(matches!(
            resolver.resolve("\\windows"),
            Err(ShareError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_dots_inside_name_are_allowed() {
        let (_dir, resolver) = setup();
        assert!(resolver.resolve("a..b.txt").is_ok());
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let (_dir, resolver) = setup();
        assert!(matches!(
            resolver.resolve("missing.txt"),
            Err(ShareError::NotFound(_))
        ));
    }

    #[test]
    fn test_file_used_as_directory_is_not_found() {
        let (_dir, resolver) = setup();
        for request in ["a.txt/", "a.txt/x", "sub/x.txt/deeper"] {
            let result = resolver.resolve(request);
            assert!(
                matches!(result, Err(ShareError::NotFound(_))),
                "{} should be not found, got {:?}",
                request,
                result
            );
        }
    }

    #[test]
    fn test_nul_byte_is_bad_request() {
        let (_dir, resolver) = setup();
        assert!(matches!(
            resolver.resolve("a.txt%00"),
            Err(ShareError::BadRequest(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_denied() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let (dir, resolver) = setup();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("sub"), dir.path().join("inside")).unwrap();

        assert!(matches!(
            resolver.resolve("escape/secret.txt"),
            Err(ShareError::AccessDenied(_))
        ));

        let inside = resolver.resolve("inside/x.txt").unwrap();
        assert!(inside.starts_with(resolver.root()));
    }

    #[test]
    fn test_new_rejects_missing_root() {
        let dir = tempdir().unwrap();
        let result = PathResolver::new(&dir.path().join("nope"));
        assert!(matches!(result, Err(ShareError::InvalidDirectory(_))));
    }

    #[test]
    fn test_virtual_path() {
        let (_dir, resolver) = setup();
        let nested = resolver.resolve("sub/x.txt").unwrap();
        assert_eq!(resolver.virtual_path(&nested).unwrap(), "sub/x.txt");
        assert_eq!(resolver.virtual_path(resolver.root()).unwrap(), "");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(sanitize_file_name("../../evil.txt").as_deref(), Some("evil.txt"));
        assert_eq!(sanitize_file_name("C:\\Users\\me\\doc.txt").as_deref(), Some("doc.txt"));
        assert_eq!(sanitize_file_name("/abs/path/photo.jpg").as_deref(), Some("photo.jpg"));
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("a/."), None);
    }

    proptest! {
        #[test]
        fn prop_dotdot_segment_is_always_denied(
            segments in proptest::collection::vec("[a-z0-9]{1,6}", 0..5),
            position in 0usize..5,
        ) {
            let (_dir, resolver) = setup();
            let mut segments = segments;
            let index = position.min(segments.len());
            segments.insert(index, "..".to_string());
            let request = segments.join("/");

            let result = resolver.resolve(&request);
            prop_assert!(matches!(result, Err(ShareError::AccessDenied(_))));
        }

        #[test]
        fn prop_absolute_is_always_denied(rest in "[a-zA-Z0-9./]{0,20}") {
            let (_dir, resolver) = setup();
            let request = format!("/{}", rest);
            prop_assert!(matches!(resolver.resolve(&request), Err(ShareError::AccessDenied(_))));
        }

        #[test]
        fn prop_resolved_paths_stay_under_root(request in "[a-z./]{0,16}") {
            let (_dir, resolver) = setup();
            if let Ok(path) = resolver.resolve(&request) {
                prop_assert!(path.starts_with(resolver.root()));
            }
        }
    }
}
