fn main() -> std::io::Result<()> {
    pb_build::pb_build()
}
