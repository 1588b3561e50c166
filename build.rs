use vergen_gix::{BuildBuilder, CargoBuilder, DependencyKind};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Build metadata is served by the info endpoint
    vergen_gix::Emitter::default()
        .add_instructions(&BuildBuilder::all_build()?)?
        .add_instructions(
            CargoBuilder::all_cargo()?.set_dep_kind_filter(Some(DependencyKind::Normal)),
        )?
        .emit()?;
    Ok(())
}
