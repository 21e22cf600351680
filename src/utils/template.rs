//! `{{var}}` placeholder rendering for step scripts.

pub struct TemplateVars;

impl TemplateVars {
    pub const VERSION: &'static str = "version";
    pub const MINOR: &'static str = "minor";
    pub const ARCH: &'static str = "arch";
    pub const DISTRO: &'static str = "distro";
    pub const NODE_NAME: &'static str = "node_name";
    pub const HOST: &'static str = "host";
    pub const POD_CIDR: &'static str = "pod_cidr";
    pub const IMAGE_REPOSITORY: &'static str = "image_repository";
    pub const IMAGE_REPOSITORY_FLAG: &'static str = "image_repository_flag";
    pub const NETWORK_ADDON_MANIFEST: &'static str = "network_addon_manifest";
    pub const PACKAGE_DIR: &'static str = "package_dir";
    pub const JOIN_COMMAND: &'static str = "join_command";
}

pub fn render(template: &str, variables: &[(&str, &str)]) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}
