//! `web_server_base` and the single-page-app server that embeds a directory
//! of static assets into the firmware image.
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{component_type, register_component};
use crate::component::{Catalog, ComponentSpec, Fragment};
use crate::ids::{TypeTag, sanitize};
use crate::ir::Expr;
use crate::schema::{Schema, Validator};
use crate::scheduler::{GenerationError, GenerationJob, StagedJob};

pub const BASE: &str = "web_server_base";
pub const SPA: &str = "web_server_spa";

pub fn base_type() -> TypeTag { TypeTag::new("web_server_base::WebServerBase") }

pub fn register(c: &mut Catalog) {
    let component = component_type(c);
    let base = c.types_mut().class(base_type().as_str(), &[&component]);
    let spa = c.types_mut().class("web_server_spa::WebServerSpa", &[&component]);

    let schema = Schema::new()
        .generated("id", Validator::DeclareId(base))
        .optional("port", Validator::port());
    c.register(ComponentSpec::new(BASE, schema).priority(65.0).to_code(base_to_code));

    let schema = Schema::new()
        .generated("id", Validator::DeclareId(spa))
        .generated("web_server_base_id", Validator::UseId(base_type()))
        .with_default("port", 80, Validator::port())
        .required("app_path", Validator::custom("directory", existing_dir));
    c.register(
        ComponentSpec::new(SPA, schema)
            .auto_load(&["json", BASE])
            .priority(40.0)
            .build_flag("-DUSE_WEB_SERVER_SPA")
            .library("ESPAsyncWebServer-esphome", Some("1.2.7"))
            .to_code(spa_to_code),
    );
}

fn existing_dir(v: &Value) -> Result<Value, String> {
    let s = v.as_str().ok_or("expected a directory path")?;
    if !Path::new(s).is_dir() {
        return Err(format!("`{s}` is not an existing directory"));
    }
    Ok(v.clone())
}

fn base_to_code(f: Fragment) -> Box<dyn GenerationJob> {
    StagedJob::new(f.instance.clone(), f)
        .then(|f, cx| {
            let id = cx.identifier(&f.id("id")?)?;
            cx.new_pvariable(&id, vec![])?;
            register_component(cx, &id)?;
            if f.has("port") {
                cx.add(&id, "set_port", vec![Expr::Int(f.int("port")?)])?;
            }
            Ok(())
        })
        .boxed()
}

fn spa_to_code(f: Fragment) -> Box<dyn GenerationJob> {
    let base = f.id("web_server_base_id").ok();
    StagedJob::new(f.instance.clone(), f)
        .after(base, |f, cx| {
            let id = cx.identifier(&f.id("id")?)?;
            let base = cx.get_variable(&f.id("web_server_base_id")?)?;
            cx.add(&base, "set_port", vec![Expr::Int(f.int("port")?)])?;
            cx.new_pvariable(&id, vec![Expr::var(&base)])?;
            register_component(cx, &id)?;

            let root = PathBuf::from(f.str("app_path")?);
            let bytes = TypeTag::new("uint8_t");
            for rel in assets(&root)? {
                let path = root.join(&rel);
                let data = fs::read(&path).map_err(|source| GenerationError::Io { path: path.display().to_string(), source })?;
                let len = data.len() as i64;
                let url = format!("/{}", rel.replace('\\', "/"));
                let name = format!("_{}", sanitize(&rel));
                let array = cx.declare(Some(name.as_str()), &bytes)?;
                cx.progmem_array(&array, data)?;
                tracing::debug!(%url, bytes = len, "embedded asset");
                cx.add(&id, "file", vec![Expr::Str(url.clone()), mime_type(&url).into(), Expr::var(&array), Expr::Int(len)])?;
            }
            Ok(())
        })
        .boxed()
}

/// Files under `root` relative to it, sorted, without source maps.
fn assets(root: &Path) -> Result<Vec<String>, GenerationError> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&root.to_string_lossy()));
    let entries = glob::glob(&pattern).map_err(|e| GenerationError::Message(format!("bad asset pattern `{pattern}`: {e}")))?;
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| GenerationError::Io { path: e.path().display().to_string(), source: e.into() })?;
        if !path.is_file() || path.extension().is_some_and(|x| x == "map") {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
    out.sort();
    Ok(out)
}

fn mime_type(url: &str) -> &'static str {
    let ext = url.rsplit_once('.').map(|(_, x)| x.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "js" => "application/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
