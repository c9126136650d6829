//! Module resolver
//!
//! Synchronous `require` across the guest/host boundary so an orchestrator
//! tool can compose library tools. Modules get CommonJS semantics: their
//! own `exports`/`module.exports`, a `require` bound to their directory,
//! and a per-execution cache that is populated *before* the body runs so
//! cycles observe the partially-built exports object.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::function::Func;
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};

use crate::error::{KernelError, Result};
use crate::sandbox::convert::exception_text;
use crate::sandbox::transpile;
use crate::vfs::{normalize_path, Vfs};

/// Appended when a module id names no extension.
const DEFAULT_EXTENSION: &str = ".ts";

pub struct ModuleResolver {
    vfs: Arc<dyn Vfs>,
    cache: RefCell<HashMap<String, Persistent<Value<'static>>>>,
}

impl ModuleResolver {
    pub fn new(vfs: Arc<dyn Vfs>) -> Rc<Self> {
        Rc::new(Self {
            vfs,
            cache: RefCell::new(HashMap::new()),
        })
    }

    /// Map a module id to a root-relative file path. Relative ids resolve
    /// against the requiring module's directory, everything else against
    /// the virtual root.
    pub fn resolve(&self, id: &str, requiring_dir: &str) -> Result<String> {
        let candidate = if id.starts_with('.') && !requiring_dir.is_empty() {
            format!("{}/{}", requiring_dir, id)
        } else {
            id.to_string()
        };
        let mut resolved = normalize_path(&candidate, false)?;

        let file_name = resolved.rsplit('/').next().unwrap_or(&resolved);
        if !file_name.contains('.') {
            resolved.push_str(DEFAULT_EXTENSION);
        }
        Ok(resolved)
    }

    /// Guest-facing `require`. All failure modes become guest exceptions
    /// naming the failing module path.
    pub fn require<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        id: &str,
        requiring_dir: &str,
    ) -> rquickjs::Result<Value<'js>> {
        let resolved = self
            .resolve(id, requiring_dir)
            .map_err(|e| Exception::throw_message(ctx, &e.to_string()))?;

        if let Some(cached) = self.cache.borrow().get(&resolved) {
            return cached.clone().restore(ctx);
        }

        let source = self.vfs.read_sync(&resolved).map_err(|e| match e {
            KernelError::NotFound(_) => Exception::throw_message(
                ctx,
                &format!("Cannot find module '{}' (resolved to '{}')", id, resolved),
            ),
            other => Exception::throw_message(ctx, &other.to_string()),
        })?;

        let code = transpile::strip_types(&resolved, &source)
            .map_err(|e| Exception::throw_message(ctx, &e.to_string()))?;

        self.evaluate_module(ctx, &resolved, &code)
    }

    /// Evaluate transpiled module code and return its `module.exports`.
    pub fn evaluate_module<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        path: &str,
        code: &str,
    ) -> rquickjs::Result<Value<'js>> {
        let exports = Object::new(ctx.clone())?;
        let module = Object::new(ctx.clone())?;
        module.set("exports", exports.clone())?;

        // Registered before the body runs: cycles see partial exports.
        self.cache.borrow_mut().insert(
            path.to_string(),
            Persistent::save(ctx, exports.clone().into_value()),
        );

        let dir = parent_dir(path).to_string();
        let require_fn = {
            let resolver = Rc::clone(self);
            // The loaded value is parked in a Persistent so the closure has
            // no lifetime tied to its calling context.
            Func::from(
                move |ctx: Ctx<'_>, id: String| -> rquickjs::Result<Persistent<Value<'static>>> {
                    let value = resolver.require(&ctx, &id, &dir)?;
                    Ok(Persistent::save(&ctx, value))
                },
            )
        };

        let wrapper = format!("(function (exports, module, require) {{\n{}\n}})", code);
        let factory: Function = ctx
            .eval(wrapper)
            .map_err(|e| rethrow(ctx, e, &format!("Failed to load module '{}'", path)))?;

        factory
            .call::<_, ()>((exports, module.clone(), require_fn))
            .map_err(|e| rethrow(ctx, e, &format!("Error in module '{}'", path)))?;

        // The body may have reassigned module.exports wholesale.
        let final_exports: Value = module.get("exports")?;
        self.cache.borrow_mut().insert(
            path.to_string(),
            Persistent::save(ctx, final_exports.clone()),
        );
        Ok(final_exports)
    }
}

/// Re-throw a guest error with module context prepended, preserving the
/// original message.
fn rethrow(ctx: &Ctx<'_>, err: rquickjs::Error, context: &str) -> rquickjs::Error {
    if matches!(err, rquickjs::Error::Exception) {
        let thrown = ctx.catch();
        Exception::throw_message(ctx, &format!("{}: {}", context, exception_text(&thrown)))
    } else {
        err
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryVfs;

    fn resolver() -> Rc<ModuleResolver> {
        ModuleResolver::new(Arc::new(MemoryVfs::new(true)))
    }

    #[test]
    fn relative_ids_resolve_against_requiring_dir() {
        let r = resolver();
        assert_eq!(
            r.resolve("./multiplier", "tools/lib").expect("resolve"),
            "tools/lib/multiplier.ts"
        );
        assert_eq!(
            r.resolve("../shared/util", "tools/lib").expect("resolve"),
            "tools/shared/util.ts"
        );
    }

    #[test]
    fn bare_ids_resolve_against_root() {
        let r = resolver();
        assert_eq!(
            r.resolve("tools/lib/multiplier", "tools").expect("resolve"),
            "tools/lib/multiplier.ts"
        );
    }

    #[test]
    fn explicit_extension_is_kept() {
        let r = resolver();
        assert_eq!(
            r.resolve("./data.json", "tools").expect("resolve"),
            "tools/data.json"
        );
    }

    #[test]
    fn escaping_the_root_is_rejected() {
        let r = resolver();
        let err = r.resolve("../../outside", "tools").expect_err("must reject");
        assert!(matches!(err, KernelError::SecurityViolation(_)));
    }
}
