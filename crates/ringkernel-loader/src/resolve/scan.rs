//! Eager include scanning.
//!
//! Walks `#include` directives textually, without running the preprocessor,
//! so the full dependency set (and therefore the fingerprint) is known before
//! any compiler is invoked. Conditional blocks are not evaluated: every
//! directive is followed, which makes the scan a superset of what the
//! compiler will actually open.
//!
//! Because of that superset, a name no provider has is not an error here.
//! It is recorded as a deferred include (fingerprinted by name) and left to
//! the toolchain, which only fails if the directive is actually live.

use std::collections::HashSet;

use crate::error::{LoaderError, Result};
use crate::request::{KernelSource, MAIN_PROGRAM_NAME};

use super::{source_text, ResolvedDependency, ResolvedSource, SourceResolver};

/// A single `#include` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective {
    /// Logical name between the delimiters.
    pub name: String,
    /// `"name"` rather than `<name>`.
    pub quoted: bool,
    /// 1-based line of the directive.
    pub line: u32,
}

/// Extracts include directives, skipping block and line comments.
pub fn include_directives(source: &str) -> Vec<IncludeDirective> {
    let mut directives = Vec::new();
    let mut in_block_comment = false;

    for (index, raw) in source.lines().enumerate() {
        let line = strip_comments(raw, &mut in_block_comment);
        let Some(rest) = line.trim_start().strip_prefix('#') else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix("include") else {
            continue;
        };
        let rest = rest.trim_start();
        let (close, quoted) = match rest.chars().next() {
            Some('"') => ('"', true),
            Some('<') => ('>', false),
            _ => continue,
        };
        if let Some(end) = rest[1..].find(close) {
            let name = rest[1..1 + end].trim();
            if !name.is_empty() {
                directives.push(IncludeDirective {
                    name: name.to_string(),
                    quoted,
                    line: index as u32 + 1,
                });
            }
        }
    }

    directives
}

fn strip_comments(line: &str, in_block_comment: &mut bool) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    loop {
        if *in_block_comment {
            match rest.find("*/") {
                Some(end) => {
                    rest = &rest[end + 2..];
                    *in_block_comment = false;
                }
                None => return out,
            }
        } else {
            let block = rest.find("/*");
            let line_comment = rest.find("//");
            match (block, line_comment) {
                (Some(b), Some(l)) if l < b => {
                    out.push_str(&rest[..l]);
                    return out;
                }
                (Some(b), _) => {
                    out.push_str(&rest[..b]);
                    out.push(' ');
                    rest = &rest[b + 2..];
                    *in_block_comment = true;
                }
                (None, Some(l)) => {
                    out.push_str(&rest[..l]);
                    return out;
                }
                (None, None) => {
                    out.push_str(rest);
                    return out;
                }
            }
        }
    }
}

/// Resolves the top-level source and every transitive include.
///
/// Quoted includes are looked up in the provider that supplied the including
/// file first, then in global search order. Angle includes always use global
/// search order. Names in `builtin_includes` are left to the toolchain, as
/// are names no provider resolves.
///
/// Fails with [`LoaderError::SourceNotFound`] only when a named top-level
/// source cannot be resolved.
pub fn scan_sources(
    source: &KernelSource,
    resolver: &SourceResolver,
    builtin_includes: &[String],
) -> Result<ResolvedSource> {
    let (origin, text, main_provider, main_label) = match source {
        KernelSource::Text(text) => (
            "text".to_string(),
            text.clone().into_bytes(),
            None,
            MAIN_PROGRAM_NAME.to_string(),
        ),
        KernelSource::Named(name) => {
            let hit = resolver
                .resolve(name)?
                .ok_or_else(|| LoaderError::SourceNotFound {
                    name: name.clone(),
                    included_from: None,
                    searched: resolver.search_order(),
                })?;
            (
                format!("{}:{}", hit.provider, name),
                hit.content,
                Some(hit.provider),
                name.clone(),
            )
        }
    };

    let builtins: HashSet<&str> = builtin_includes.iter().map(String::as_str).collect();
    let mut dependencies = Vec::new();
    let mut builtin_used = Vec::new();
    let mut deferred = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = vec![(main_label, main_provider, text.clone())];

    while let Some((label, provider, content)) = pending.pop() {
        for directive in include_directives(&source_text(&content)) {
            if builtins.contains(directive.name.as_str()) {
                if !builtin_used.contains(&directive.name) {
                    builtin_used.push(directive.name);
                }
                continue;
            }

            let local = match (directive.quoted, provider.as_deref()) {
                (true, Some(p)) => resolver.resolve_in(p, &directive.name)?,
                _ => None,
            };
            let hit = match local {
                Some(hit) => hit,
                None => match resolver.resolve(&directive.name)? {
                    Some(hit) => hit,
                    None => {
                        if !deferred.contains(&directive.name) {
                            tracing::debug!(
                                include = %directive.name,
                                from = %label,
                                line = directive.line,
                                "No provider has include, deferring to toolchain"
                            );
                            deferred.push(directive.name);
                        }
                        continue;
                    }
                },
            };

            if visited.insert((directive.name.clone(), hit.provider.clone())) {
                tracing::trace!(
                    include = %directive.name,
                    provider = %hit.provider,
                    from = %label,
                    "Resolved include"
                );
                dependencies.push(ResolvedDependency {
                    name: directive.name.clone(),
                    provider: hit.provider.clone(),
                    content: hit.content.clone(),
                    included_from: Some(label.clone()),
                });
                pending.push((directive.name, Some(hit.provider), hit.content));
            }
        }
    }

    Ok(ResolvedSource {
        origin,
        text,
        dependencies,
        builtin_includes: builtin_used,
        deferred_includes: deferred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::EmbeddedProvider;
    use std::sync::Arc;

    fn resolver(files: &[(&str, &str)]) -> SourceResolver {
        let mut resolver = SourceResolver::new();
        resolver.register(
            Arc::new(EmbeddedProvider::from_entries(
                "test",
                files.iter().map(|(n, c)| (n.to_string(), c.to_string())),
            )),
            0,
        );
        resolver
    }

    #[test]
    fn test_include_directives() {
        let src = r#"
#include <vec.cuh>
  #  include "local/mat.cuh"
// #include "commented.cuh"
/* #include "block.cuh"
   #include "still_block.cuh" */
#include "after.cuh" // trailing
#define FOO 1
#include MACRO_HEADER
"#;
        let names: Vec<_> = include_directives(src)
            .into_iter()
            .map(|d| (d.name, d.quoted, d.line))
            .collect();
        assert_eq!(
            names,
            vec![
                ("vec.cuh".to_string(), false, 2),
                ("local/mat.cuh".to_string(), true, 3),
                ("after.cuh".to_string(), true, 7),
            ]
        );
    }

    #[test]
    fn test_scan_transitive_with_cycle() {
        let resolver = resolver(&[
            ("a.cuh", "#pragma once\n#include \"b.cuh\"\n"),
            ("b.cuh", "#pragma once\n#include \"a.cuh\"\n#include <c.cuh>\n"),
            ("c.cuh", "int c;"),
        ]);
        let resolved = scan_sources(
            &KernelSource::text("#include \"a.cuh\"\n__global__ void k() {}"),
            &resolver,
            &[],
        )
        .unwrap();

        let mut names: Vec<_> = resolved.dependencies.iter().map(|d| d.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a.cuh", "b.cuh", "c.cuh"]);
        assert_eq!(resolved.origin, "text");
        assert_eq!(resolved.headers().len(), 3);
    }

    #[test]
    fn test_scan_defers_unresolved_includes() {
        let resolver = resolver(&[("a.cuh", "#include \"missing.cuh\"\n")]);
        let resolved = scan_sources(
            &KernelSource::text(
                "#ifndef __CUDACC_RTC__\n#include <cstdio>\n#endif\n#include <a.cuh>\n#include <cstdio>\n",
            ),
            &resolver,
            &[],
        )
        .unwrap();

        assert_eq!(resolved.dependencies.len(), 1);
        assert_eq!(resolved.dependencies[0].name, "a.cuh");
        let mut deferred = resolved.deferred_includes.clone();
        deferred.sort();
        assert_eq!(deferred, vec!["cstdio".to_string(), "missing.cuh".to_string()]);
    }

    #[test]
    fn test_scan_keeps_raw_bytes() {
        let mut resolver = SourceResolver::new();
        resolver.register(
            Arc::new(EmbeddedProvider::from_entries(
                "test",
                [("vec.cuh".to_string(), "#include \"w.cuh\"\n".to_string())],
            )),
            0,
        );
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("w.cuh"), b"// caf\xe9\n#define W 4\n").unwrap();
        let resolver = resolver.with_request_roots(&[dir.path().to_path_buf()]);

        let resolved =
            scan_sources(&KernelSource::text("#include <vec.cuh>\n"), &resolver, &[]).unwrap();
        let w = resolved.dependency("w.cuh", None).unwrap();
        assert_eq!(w.content, b"// caf\xe9\n#define W 4\n");
        assert!(w.provider.starts_with("fs:"));
        assert!(resolved.deferred_includes.is_empty());
    }

    #[test]
    fn test_scan_named_source() {
        let resolver = resolver(&[("axpy.cuh", "#include <vec.cuh>\n"), ("vec.cuh", "")]);
        let resolved = scan_sources(&KernelSource::named("axpy.cuh"), &resolver, &[]).unwrap();
        assert_eq!(resolved.origin, "embedded:test:axpy.cuh");
        assert_eq!(resolved.dependencies.len(), 1);
        assert_eq!(resolved.dependencies[0].included_from.as_deref(), Some("axpy.cuh"));

        let err = scan_sources(&KernelSource::named("nope.cuh"), &resolver, &[]).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::SourceNotFound { included_from: None, .. }
        ));
    }

    #[test]
    fn test_builtin_includes_are_not_resolved() {
        let resolver = resolver(&[]);
        let resolved = scan_sources(
            &KernelSource::text("#include <cuda_fp16.h>\n#include <cuda_fp16.h>\n"),
            &resolver,
            &["cuda_fp16.h".to_string()],
        )
        .unwrap();
        assert!(resolved.dependencies.is_empty());
        assert_eq!(resolved.builtin_includes, vec!["cuda_fp16.h".to_string()]);
    }

    #[test]
    fn test_quoted_include_prefers_including_provider() {
        let mut resolver = SourceResolver::new();
        resolver.register(
            Arc::new(EmbeddedProvider::from_entries(
                "high",
                [("common.cuh".to_string(), "high".to_string())],
            )),
            10,
        );
        resolver.register(
            Arc::new(EmbeddedProvider::from_entries(
                "low",
                [
                    ("kernel.cuh".to_string(), "#include \"common.cuh\"\n".to_string()),
                    ("common.cuh".to_string(), "low".to_string()),
                ],
            )),
            0,
        );
        let resolved =
            scan_sources(&KernelSource::named("kernel.cuh"), &resolver, &[]).unwrap();
        let dep = &resolved.dependencies[0];
        assert_eq!(dep.provider, "embedded:low");
        assert_eq!(dep.content, b"low");
    }
}
