fn main() -> anyhow::Result<()> {
    mesa_pos_lib::run()
}
