fn main() -> anyhow::Result<()> {
    camrig_lib::run()
}
