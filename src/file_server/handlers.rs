//! HTTP 路由处理器
//!
//! 实现目录浏览、文件/目录下载、上传与新建目录端点，以及访问日志中间件。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::FormRejection,
        ConnectInfo, Form, Multipart, Query, Request, State,
    },
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::archive;
use super::listing;
use super::paths::sanitize_file_name;
use super::state::{ShareState, SharedState};
use crate::error::{ErrorDetail, ShareError};

/// 上传 / 新建目录的目标目录（相对共享根目录，缺省为根目录）
#[derive(Debug, Default, Deserialize)]
pub struct TargetQuery {
    pub dir: Option<String>,
}

/// 新建目录表单
#[derive(Debug, Deserialize)]
pub struct CreateDirectoryForm {
    pub dirname: Option<String>,
}

/// 下载响应的展示方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// 浏览器内打开，按扩展名推断类型
    Inline,
    /// 作为附件下载
    Attachment,
}

/// GET 任意路径（其余未匹配的请求也落到这里）
///
/// 目录返回列表页面，文件直接在浏览器中打开；OPTIONS 返回空的 200。
pub async fn browse(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
) -> Result<Response, ShareError> {
    if method == Method::OPTIONS {
        return Ok(StatusCode::OK.into_response());
    }
    if method != Method::GET && method != Method::HEAD {
        return Err(ShareError::NotFound(format!("No route for {} {}", method, uri.path())));
    }

    let raw = uri.path().strip_prefix('/').unwrap_or(uri.path());
    let path = state.resolver.resolve(raw)?;

    if path.is_dir() {
        if !raw.is_empty() && !raw.ends_with('/') {
            let location = format!("{}/", uri.path());
            return Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response());
        }
        return list_directory(&state, path).await;
    }

    stream_file(&state, &path, Disposition::Inline).await
}

/// GET /download/{*path}
///
/// 文件以附件形式下载，目录打包为 zip 后下载。
pub async fn download(
    State(state): State<SharedState>,
    uri: Uri,
) -> Result<Response, ShareError> {
    let raw = uri
        .path()
        .strip_prefix("/download")
        .map(|rest| rest.strip_prefix('/').unwrap_or(rest))
        .unwrap_or("");
    let path = state.resolver.resolve(raw)?;

    if path.is_file() {
        stream_file(&state, &path, Disposition::Attachment).await
    } else if path.is_dir() {
        download_directory(&state, path).await
    } else {
        Err(ShareError::BadRequest("Invalid download target".to_string()))
    }
}

/// POST /upload
///
/// 只接受恰好一个文件字段；文件名裁剪为纯文件名；同名文件已存在时返回 409。
/// 内容先写入目标目录下的临时文件，再以不覆盖的原子重命名发布。
pub async fn upload(
    State(state): State<SharedState>,
    Query(target): Query<TargetQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ShareError> {
    let directory = target_directory(&state, target.dir.as_deref())?;
    let mut multipart = multipart.map_err(|e| ShareError::BadRequest(e.body_text()))?;

    let mut received: Option<(String, PathBuf, NamedTempFile, u64)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ShareError::BadRequest(e.body_text()))?
    {
        let file_name = match field.file_name() {
            Some(name) => name.to_string(),
            None => continue,
        };

        if received.is_some() {
            return Err(ShareError::BadRequest(
                "Only one file per upload is supported".to_string(),
            ));
        }

        // 浏览器未选择文件时会提交空文件名
        let name = match sanitize_file_name(&file_name) {
            Some(name) => name,
            None => continue,
        };

        let destination = directory.join(&name);
        if destination.exists() {
            return Err(ShareError::Conflict(format!("File already exists: {}", name)));
        }

        let (temp, size) = receive_part(field, &directory).await?;
        received = Some((name, destination, temp, size));
    }

    let (name, destination, temp, size) = received
        .ok_or_else(|| ShareError::BadRequest("No file part in request".to_string()))?;

    temp.persist_noclobber(&destination).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            ShareError::Conflict(format!("File already exists: {}", name))
        } else {
            ShareError::server(format!("Failed to save {}: {}", name, e.error))
        }
    })?;

    state.stats.record_upload(size);
    state.log.info(format!(
        "File uploaded: {} ({})",
        name,
        listing::format_size(size)
    ));

    Ok(redirect_to_listing(&state, &directory))
}

/// POST /create_directory
///
/// 目录已存在不视为错误；同名的非目录项返回 409。
pub async fn create_directory(
    State(state): State<SharedState>,
    Query(target): Query<TargetQuery>,
    form: Result<Form<CreateDirectoryForm>, FormRejection>,
) -> Result<Response, ShareError> {
    let directory = target_directory(&state, target.dir.as_deref())?;

    let dirname = form
        .ok()
        .and_then(|Form(form)| form.dirname)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ShareError::BadRequest("Missing directory name".to_string()))?;
    let name = sanitize_file_name(&dirname)
        .ok_or_else(|| ShareError::BadRequest(format!("Invalid directory name: {}", dirname)))?;

    let new_dir = directory.join(&name);
    match tokio::fs::create_dir(&new_dir).await {
        Ok(()) => state.log.info(format!("Directory created: {}", name)),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if !new_dir.is_dir() {
                return Err(ShareError::Conflict(format!(
                    "A file named {} already exists",
                    name
                )));
            }
            state.log.info(format!("Directory already exists: {}", name));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(redirect_to_listing(&state, &directory))
}

/// GET /favicon.ico
pub async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// 访问日志中间件
///
/// 每个请求记录一行；失败的请求以 ERROR 级别记录，并带上错误详情。
pub async fn access_log(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let response = next.run(request).await;
    state.stats.record_request();

    let path = match urlencoding::decode(&path) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => path.clone(),
    };
    let status = response.status();
    let line = format!("{} - \"{} {}\" {}", client, method, path, status.as_u16());

    if status.is_client_error() || status.is_server_error() {
        match response.extensions().get::<ErrorDetail>() {
            Some(ErrorDetail(detail)) => state.log.error(format!("{} - {}", line, detail)),
            None => state.log.error(line),
        }
    } else {
        state.log.info(line);
    }

    response
}

async fn list_directory(state: &ShareState, path: PathBuf) -> Result<Response, ShareError> {
    let virtual_dir = state.resolver.virtual_path(&path).unwrap_or_default();
    let log = state.log.clone();
    let dir = virtual_dir.clone();

    let entries = tokio::task::spawn_blocking(move || listing::collect_entries(&path, &dir, &log))
        .await
        .map_err(|e| ShareError::server(format!("Listing task failed: {}", e)))??;

    Ok(Html(listing::render_listing(&virtual_dir, &entries)).into_response())
}

async fn stream_file(
    state: &ShareState,
    path: &Path,
    disposition: Disposition,
) -> Result<Response, ShareError> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let name = display_name(path);

    let content_type = match disposition {
        Disposition::Inline => mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string(),
        Disposition::Attachment => "application/octet-stream".to_string(),
    };

    let log = state.log.clone();
    let label = name.clone();
    let stream = ReaderStream::new(file)
        .inspect_err(move |e| log.error(format!("Transfer of {} aborted: {}", label, e)));

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, size);
    if disposition == Disposition::Attachment {
        builder = builder.header(header::CONTENT_DISPOSITION, attachment_header(&name)?);
        state.log.info(format!(
            "File downloaded: {} ({})",
            name,
            listing::format_size(size)
        ));
    }

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ShareError::server(e.to_string()))
}

async fn download_directory(state: &ShareState, path: PathBuf) -> Result<Response, ShareError> {
    let folder_name = display_name(&path);
    let archive_path = path.clone();

    let archive = match tokio::task::spawn_blocking(move || archive::build_zip(&archive_path)).await {
        Ok(result) => result?,
        Err(e) => return Err(ShareError::server(format!("Archive task failed: {}", e))),
    };

    let file = tokio::fs::File::open(&archive).await?;
    let size = file.metadata().await?.len();

    let log = state.log.clone();
    let label = folder_name.clone();
    // 响应体持有临时归档，传输结束或连接中断时随之删除
    let stream = ReaderStream::new(file)
        .inspect_err(move |e| log.error(format!("Transfer of {}.zip aborted: {}", label, e)))
        .map(move |chunk| {
            let _keep = &archive;
            chunk
        });

    state.log.info(format!(
        "Folder downloaded as zip: {} ({})",
        folder_name,
        listing::format_size(size)
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_LENGTH, size)
        .header(
            header::CONTENT_DISPOSITION,
            attachment_header(&format!("{}.zip", folder_name))?,
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ShareError::server(e.to_string()))
}

/// 将单个文件字段写入目标目录下的临时文件
async fn receive_part(
    mut field: Field<'_>,
    directory: &Path,
) -> Result<(NamedTempFile, u64), ShareError> {
    let temp = tempfile::Builder::new()
        .prefix(".dirshare-upload-")
        .tempfile_in(directory)
        .map_err(|e| ShareError::server(format!("Failed to create temp file: {}", e)))?;
    let mut file = tokio::fs::File::from_std(temp.reopen()?);

    let mut size = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ShareError::BadRequest(e.body_text()))?
    {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((temp, size))
}

fn target_directory(state: &ShareState, dir: Option<&str>) -> Result<PathBuf, ShareError> {
    let directory = state.resolver.resolve_decoded(dir.unwrap_or(""))?;
    if !directory.is_dir() {
        return Err(ShareError::BadRequest(format!(
            "Not a directory: {}",
            dir.unwrap_or("/")
        )));
    }
    Ok(directory)
}

/// 302 跳转回目录列表页面
fn redirect_to_listing(state: &ShareState, directory: &Path) -> Response {
    let location = state
        .resolver
        .virtual_path(directory)
        .map(|v| listing::listing_href(&v))
        .unwrap_or_else(|| "/".to_string());
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string())
}

/// `Content-Disposition: attachment`，非 ASCII 文件名附带 RFC 5987 `filename*`
fn attachment_header(name: &str) -> Result<HeaderValue, ShareError> {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let value = if fallback == name {
        format!("attachment; filename=\"{}\"", name)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            urlencoding::encode(name)
        )
    };

    HeaderValue::from_str(&value).map_err(|e| ShareError::server(e.to_string()))
}
