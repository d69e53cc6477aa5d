//! Named schema sources and their compilation to descriptors.
//!
//! Sources are kept in memory under the file name other sources `import`
//! them by, then compiled together with `protox`. Imports of the
//! well-known `google/protobuf/*.proto` files resolve to protox's bundled
//! copies.

use std::path::Path;

use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorProto;
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};
use protox::Compiler;

use crate::error::{GatewayError, Result};

/// Kind of top-level declaration, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TopLevel {
    Message(String),
    Enum(String),
}

impl TopLevel {
    pub(crate) fn name(&self) -> &str {
        match self {
            TopLevel::Message(name) | TopLevel::Enum(name) => name,
        }
    }
}

/// Parse one source without resolving its type references.
pub(crate) fn parse(name: &str, source: &str) -> Result<FileDescriptorProto> {
    protox_parse::parse(name, source).map_err(|e| GatewayError::Schema(format!("{}: {}", name, e)))
}

/// Top-level messages and enums of a parsed file, interleaved as declared.
pub(crate) fn declaration_order(file: &FileDescriptorProto) -> Result<Vec<TopLevel>> {
    let locations = file
        .source_code_info
        .as_ref()
        .map(|info| info.location.as_slice())
        .unwrap_or_default();

    let mut positioned: Vec<((i32, i32), TopLevel)> = locations
        .iter()
        .filter_map(|location| {
            let start = (*location.span.first()?, *location.span.get(1)?);
            let declaration = match location.path.as_slice() {
                [4, index] => TopLevel::Message(
                    file.message_type.get(usize::try_from(*index).ok()?)?.name().to_string(),
                ),
                [5, index] => TopLevel::Enum(
                    file.enum_type.get(usize::try_from(*index).ok()?)?.name().to_string(),
                ),
                _ => return None,
            };
            Some((start, declaration))
        })
        .collect();
    positioned.sort_by_key(|(start, _)| *start);
    positioned.dedup();

    if positioned.len() != file.message_type.len() + file.enum_type.len() {
        return Err(GatewayError::Schema(format!(
            "{}: declaration positions are unavailable",
            file.name()
        )));
    }
    Ok(positioned.into_iter().map(|(_, declaration)| declaration).collect())
}

/// Schema sources keyed by file name.
#[derive(Debug, Default, Clone)]
pub(crate) struct SourceSet {
    sources: Vec<(String, String)>,
}

impl SourceSet {
    pub(crate) fn insert(&mut self, name: &str, source: &str) -> Result<()> {
        if self.sources.iter().any(|(existing, _)| existing == name) {
            return Err(GatewayError::Schema(format!("Schema file {} is loaded twice", name)));
        }
        self.sources.push((name.to_string(), source.to_string()));
        Ok(())
    }

    /// Compile every source into one descriptor pool.
    ///
    /// Unresolved type references, unresolved imports and duplicate type
    /// names are reported here.
    pub(crate) fn compile(&self) -> Result<DescriptorPool> {
        let mut resolver = ChainFileResolver::new();
        resolver.add(self.clone());
        resolver.add(GoogleFileResolver::new());

        let mut compiler = Compiler::with_file_resolver(resolver);
        compiler
            .open_files(self.sources.iter().map(|(name, _)| name.as_str()))
            .map_err(|e| GatewayError::Schema(e.to_string()))?;
        Ok(compiler.descriptor_pool())
    }
}

impl FileResolver for SourceSet {
    fn resolve_path(&self, path: &Path) -> Option<String> {
        let name = path.to_str()?;
        self.sources
            .iter()
            .any(|(existing, _)| existing == name)
            .then(|| name.to_string())
    }

    fn open_file(&self, name: &str) -> std::result::Result<File, protox::Error> {
        match self.sources.iter().find(|(existing, _)| existing == name) {
            Some((name, source)) => File::from_source(name, source),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}
