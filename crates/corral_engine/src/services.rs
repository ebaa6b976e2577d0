use corral_core::prelude::*;

#[derive(Clone)]
pub struct CoreServices<C, R, B> {
    pub catalog: C,
    pub runtime: R,
    pub backend: B,
}

impl<C, R, B> EngineServices for CoreServices<C, R, B>
where
    C: Catalog,
    R: ContainerRuntime,
    B: StateBackend,
{
    type Catalog = C;
    type Runtime = R;
    type Backend = B;

    fn catalog(&self) -> &C {
        &self.catalog
    }
    fn runtime(&self) -> &R {
        &self.runtime
    }
    fn backend(&self) -> &B {
        &self.backend
    }
}
