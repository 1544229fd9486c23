//! The JIT back end the VM talks to

use std::rc::Rc;
use std::time::Instant;

use bytecode_system::{Constant, Opcode};
use core_types::RegionId;
use interpreter::{CompileRefusal, CompileRequest, CompiledCode, JitBackend, SiteKind};
use tracing::debug;

use crate::code_cache::{CacheStats, CodeCache, ExecutableMemory};
use crate::compiled_code::{CallSite, CompiledEntry, FieldSite, Sites};
use crate::cranelift_backend::CraneliftBackend;

/// Compiles hot regions with Cranelift and owns their machine code
#[derive(Debug)]
pub struct JitCompiler {
    backend: CraneliftBackend,
    cache: CodeCache,
}

impl JitCompiler {
    /// Compiler for the host machine
    ///
    /// # Errors
    ///
    /// Fails when Cranelift does not support the host.
    pub fn new() -> Result<Self, CompileRefusal> {
        Ok(Self {
            backend: CraneliftBackend::new()?,
            cache: CodeCache::new(),
        })
    }

    /// Code cache
    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Release retired code no frame still runs; returns how many entries.
    pub fn reclaim(&mut self) -> usize {
        self.cache.reclaim()
    }

    /// Installed entry of a region
    pub fn entry(&self, region: RegionId) -> Option<Rc<CompiledEntry>> {
        self.cache.get(region).cloned()
    }

    /// Compile a region and install it in the cache.
    ///
    /// # Errors
    ///
    /// Refusals from code generation and from mapping executable memory.
    pub fn compile_entry(
        &mut self,
        request: &CompileRequest<'_>,
    ) -> Result<Rc<CompiledEntry>, CompileRefusal> {
        let started = Instant::now();
        let sites = inline_caches(request)?;

        let compiled = self.backend.compile(request, &sites)?;
        let memory = ExecutableMemory::new(&compiled.code)
            .map_err(|e| CompileRefusal::ExecutableMemory(e.to_string()))?;
        let (exits, guards) = compiled.lowered.exits.into_parts();

        debug!(
            region = %request.region,
            speculation = ?request.speculation,
            bytes = memory.len(),
            exits = exits.len(),
            guards = guards.len(),
            call_sites = sites.calls.len(),
            field_sites = sites.fields.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "compiled region"
        );

        let entry = Rc::new(CompiledEntry::new(
            request.region,
            request.speculation,
            memory,
            exits,
            guards,
            sites,
            compiled.lowered.specializations,
        ));
        self.cache.insert(Rc::clone(&entry));
        Ok(entry)
    }
}

/// One cache per call and field access in the region
fn inline_caches(request: &CompileRequest<'_>) -> Result<Sites, CompileRefusal> {
    let limit = request.ic_polymorphic_limit;
    let mut calls = Vec::new();
    let mut fields = Vec::new();
    for offset in request.span() {
        let (kind, name) = match request.function.code[offset].opcode {
            Opcode::Call(_) => {
                calls.push(CallSite::new(offset, limit));
                continue;
            }
            Opcode::GetField(name) => (SiteKind::GetField, name),
            Opcode::SetField(name) => (SiteKind::SetField, name),
            _ => continue,
        };
        let Some(Constant::Str(key)) = request.function.constants.get(name as usize) else {
            return Err(CompileRefusal::Backend(format!(
                "field name at offset {offset} is not a string constant"
            )));
        };
        fields.push(FieldSite::new(kind, offset, name, key, limit));
    }
    Ok(Sites {
        calls: calls.into_boxed_slice(),
        fields: fields.into_boxed_slice(),
    })
}

impl JitBackend for JitCompiler {
    fn compile(&mut self, request: &CompileRequest<'_>) -> Result<Rc<dyn CompiledCode>, CompileRefusal> {
        let entry: Rc<dyn CompiledCode> = self.compile_entry(request)?;
        Ok(entry)
    }

    fn retire(&mut self, region: RegionId) {
        self.cache.retire(region);
    }

    fn reclaim(&mut self) -> usize {
        self.cache.reclaim()
    }
}
