fn main() -> anyhow::Result<()> {
    cosim_sim::entrypoint()
}
