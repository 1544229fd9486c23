//! Cranelift-based code generation
//!
//! Compiles lowered regions to position-independent machine code for the
//! host. Helpers are called through absolute addresses baked into the code,
//! so the output needs no relocations and can be copied anywhere.

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::{Function, UserFuncName};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::FunctionBuilderContext;
use interpreter::{CompileRefusal, CompileRequest};
use target_lexicon::PointerWidth;

use crate::codegen::{lower_region, Lowered};
use crate::compiled_code::Sites;

/// Machine code for one region plus its lowering metadata
#[derive(Debug)]
pub struct CompiledFunction {
    /// Relocation-free code bytes
    pub code: Vec<u8>,
    /// Exits, guards and chosen specializations
    pub lowered: Lowered,
}

/// Cranelift backend
///
/// Holds the host ISA and reusable compilation contexts.
pub struct CraneliftBackend {
    isa: OwnedTargetIsa,
    ctx: Context,
    builder_ctx: FunctionBuilderContext,
    func_counter: u32,
}

impl std::fmt::Debug for CraneliftBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CraneliftBackend")
            .field("triple", &self.isa.triple().to_string())
            .field("func_counter", &self.func_counter)
            .finish()
    }
}

impl CraneliftBackend {
    /// Create a backend for the host machine
    ///
    /// # Errors
    ///
    /// Fails when the host is not supported by Cranelift or is not a
    /// 64-bit target; values are 64-bit words passed in registers.
    pub fn new() -> Result<Self, CompileRefusal> {
        let backend = |e: String| CompileRefusal::Backend(e);

        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| backend(e.to_string()))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| backend(e.to_string()))?;

        let isa_builder = cranelift_native::builder().map_err(|e| backend(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| backend(e.to_string()))?;
        if !matches!(isa.triple().pointer_width(), Ok(PointerWidth::U64)) {
            return Err(backend(format!("unsupported target {}", isa.triple())));
        }

        Ok(Self {
            isa,
            ctx: Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
            func_counter: 0,
        })
    }

    /// Target triple of the host
    pub fn triple(&self) -> String {
        self.isa.triple().to_string()
    }

    /// Compile a region
    ///
    /// # Errors
    ///
    /// Planning refusals, Cranelift errors (verifier included) and code
    /// that would need relocations.
    pub fn compile(
        &mut self,
        request: &CompileRequest<'_>,
        sites: &Sites,
    ) -> Result<CompiledFunction, CompileRefusal> {
        self.ctx.clear();
        self.ctx.func = Function::with_name_signature(
            UserFuncName::user(0, self.func_counter),
            self.ctx.func.signature.clone(),
        );
        self.func_counter += 1;

        let lowered = lower_region(
            &mut self.ctx.func,
            &mut self.builder_ctx,
            request,
            self.isa.default_call_conv(),
            sites,
        )?;

        let compiled = self
            .ctx
            .compile(&*self.isa, &mut ControlPlane::default())
            .map_err(|e| CompileRefusal::Backend(e.inner.to_string()))?;
        if !compiled.buffer.relocs().is_empty() {
            return Err(CompileRefusal::Backend(format!(
                "{} relocations in region {}",
                compiled.buffer.relocs().len(),
                request.region
            )));
        }
        let code = compiled.code_buffer().to_vec();
        Ok(CompiledFunction { code, lowered })
    }
}
