use std::path::Path;

// Compiled the same way the teacher's `protos` crate does: parse with
// `protox` (no system `protoc` required) and hand the resulting
// `FileDescriptorSet` to `tonic-prost-build` for codegen.
fn main() -> anyhow::Result<()> {
	let proto_root = Path::new("proto");
	let files = [
		"proto/envoy/service/auth/v3/external_auth.proto",
		"proto/envoy/service/ratelimit/v3/rls.proto",
		"proto/envoy/type/v3/http_status.proto",
		"proto/google/rpc/status.proto",
		"proto/prometheus/remote.proto",
	];

	for file in files {
		println!("cargo:rerun-if-changed={file}");
	}

	let file_descriptor_set = protox::compile(files, [proto_root])?;

	tonic_prost_build::configure()
		.build_server(true)
		.build_client(true)
		.compile_fds(file_descriptor_set)?;

	Ok(())
}
