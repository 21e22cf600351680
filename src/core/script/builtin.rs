//! Built-in step scripts.
//!
//! Templates use `{{var}}` placeholders, see [`crate::utils::template::TemplateVars`].
//! Distribution-specific steps fail for unknown distributions; the rest share
//! one script across all of them.

use crate::error::{Error, Result};
use crate::pipeline::StepName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroFamily {
    Debian,
    RedHat,
}

pub fn family(distro: &str) -> Option<DistroFamily> {
    match distro {
        "ubuntu" | "debian" | "linuxmint" | "uos" | "deepin" => Some(DistroFamily::Debian),
        "centos" | "rhel" | "rocky" | "almalinux" | "fedora" | "openeuler" | "kylin"
        | "anolis" | "ol" => Some(DistroFamily::RedHat),
        _ => None,
    }
}

/// Sets and persists `net.ipv4.ip_forward`, then proves it took effect.
pub const IP_FORWARD: &str = r#"sysctl -w net.ipv4.ip_forward=1
if grep -q '^net.ipv4.ip_forward' /etc/sysctl.conf; then
  sed -i 's/^net.ipv4.ip_forward.*/net.ipv4.ip_forward = 1/' /etc/sysctl.conf
else
  echo 'net.ipv4.ip_forward = 1' >> /etc/sysctl.conf
fi
test "$(cat /proc/sys/net/ipv4/ip_forward)" = "1""#;

/// Kernel prerequisites for the pod network add-on, run before joining.
pub const JOIN_PRIMING: &str = r#"modprobe overlay || true
modprobe br_netfilter || true
sysctl -w net.bridge.bridge-nf-call-iptables=1 || true
sysctl -w net.bridge.bridge-nf-call-ip6tables=1 || true
sysctl -w net.ipv4.ip_forward=1 || true"#;

pub const DETECT_DISTRO: &str = r#". /etc/os-release && echo "$ID""#;

pub const PRINT_JOIN_COMMAND: &str = "kubeadm token create --print-join-command";

pub const CREATE_TOKEN: &str = "kubeadm token create";

pub const CA_CERT_HASH: &str = "openssl x509 -pubkey -in /etc/kubernetes/pki/ca.crt \
| openssl rsa -pubin -outform der 2>/dev/null \
| openssl dgst -sha256 -hex | sed 's/^.* //'";

const SYSTEM_PREPARATION_COMMON: &str = r#"set -e
swapoff -a
sed -ri '/\sswap\s/s/^#?/#/' /etc/fstab
cat <<'EOF' > /etc/modules-load.d/k8s.conf
overlay
br_netfilter
EOF
modprobe overlay
modprobe br_netfilter
cat <<'EOF' > /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF
sysctl --system
hostnamectl set-hostname {{node_name}} || true
"#;

const SYSTEM_PREPARATION_DEBIAN: &str = "systemctl disable --now ufw || true\n";

const SYSTEM_PREPARATION_REDHAT: &str = r#"setenforce 0 || true
sed -i 's/^SELINUX=enforcing$/SELINUX=permissive/' /etc/selinux/config || true
systemctl disable --now firewalld || true
"#;

const RUNTIME_INSTALL_DEBIAN: &str = r#"set -e
export DEBIAN_FRONTEND=noninteractive
apt-get update
apt-get install -y containerd"#;

const RUNTIME_INSTALL_REDHAT: &str = r#"set -e
yum install -y yum-utils
yum-config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo
yum install -y containerd.io"#;

const RUNTIME_CONFIGURE: &str = r##"set -e
mkdir -p /etc/containerd
containerd config default > /etc/containerd/config.toml
sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml
if [ -n "{{image_repository}}" ]; then
  sed -i 's#sandbox_image = .*#sandbox_image = "{{image_repository}}/pause:3.9"#' /etc/containerd/config.toml
fi
systemctl daemon-reload
systemctl enable containerd
systemctl restart containerd"##;

const REPOSITORY_DEBIAN: &str = r#"set -e
export DEBIAN_FRONTEND=noninteractive
apt-get update
apt-get install -y apt-transport-https ca-certificates curl gpg
mkdir -p -m 755 /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/{{minor}}/deb/Release.key | gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/{{minor}}/deb/ /' > /etc/apt/sources.list.d/kubernetes.list
apt-get update"#;

const REPOSITORY_REDHAT: &str = r#"set -e
cat <<'EOF' > /etc/yum.repos.d/kubernetes.repo
[kubernetes]
name=Kubernetes
baseurl=https://pkgs.k8s.io/core:/stable:/{{minor}}/rpm/
enabled=1
gpgcheck=1
gpgkey=https://pkgs.k8s.io/core:/stable:/{{minor}}/rpm/repodata/repomd.xml.key
exclude=kubelet kubeadm kubectl cri-tools kubernetes-cni
EOF
yum makecache -y"#;

const COMPONENTS_DEBIAN: &str = r#"set -e
export DEBIAN_FRONTEND=noninteractive
if [ -n "{{package_dir}}" ] && ls {{package_dir}}/*.deb >/dev/null 2>&1; then
  dpkg -i {{package_dir}}/*.deb || apt-get install -f -y
else
  apt-get install -y kubelet={{version}}-* kubeadm={{version}}-* kubectl={{version}}-*
fi
apt-mark hold kubelet kubeadm kubectl
systemctl enable --now kubelet"#;

const COMPONENTS_REDHAT: &str = r#"set -e
if [ -n "{{package_dir}}" ] && ls {{package_dir}}/*.rpm >/dev/null 2>&1; then
  rpm -Uvh --replacepkgs {{package_dir}}/*.rpm
else
  yum install -y kubelet-{{version}} kubeadm-{{version}} kubectl-{{version}} --disableexcludes=kubernetes
fi
systemctl enable --now kubelet"#;

const PRIMARY_INIT: &str = r#"set -e
kubeadm init --kubernetes-version=v{{version}} --pod-network-cidr={{pod_cidr}} --apiserver-advertise-address={{host}} --node-name={{node_name}} {{image_repository_flag}}
mkdir -p $HOME/.kube
cp -f /etc/kubernetes/admin.conf $HOME/.kube/config
chown $(id -u):$(id -g) $HOME/.kube/config
kubectl apply -f {{network_addon_manifest}}"#;

const SECONDARY_JOIN: &str = "{{join_command}} --node-name={{node_name}}";

const CLUSTER_VERIFICATION: &str = r#"kubectl get nodes -o wide
kubectl get pods -n kube-system -o wide"#;

/// Built-in script text for `step` on `distro`.
pub fn script(step: StepName, distro: &str) -> Result<String> {
    let family = family(distro);
    let unsupported = || Error::script_unsupported_distribution(step.as_str(), distro);

    let text = match step {
        StepName::SystemPreparation => {
            let tail = match family.ok_or_else(unsupported)? {
                DistroFamily::Debian => SYSTEM_PREPARATION_DEBIAN,
                DistroFamily::RedHat => SYSTEM_PREPARATION_REDHAT,
            };
            format!("{}{}", SYSTEM_PREPARATION_COMMON, tail)
        }
        StepName::IpForwardConfiguration => IP_FORWARD.to_string(),
        StepName::ContainerRuntimeInstall => match family.ok_or_else(unsupported)? {
            DistroFamily::Debian => RUNTIME_INSTALL_DEBIAN.to_string(),
            DistroFamily::RedHat => RUNTIME_INSTALL_REDHAT.to_string(),
        },
        StepName::ContainerRuntimeConfigure => RUNTIME_CONFIGURE.to_string(),
        StepName::RepositoryConfiguration => match family.ok_or_else(unsupported)? {
            DistroFamily::Debian => REPOSITORY_DEBIAN.to_string(),
            DistroFamily::RedHat => REPOSITORY_REDHAT.to_string(),
        },
        StepName::ComponentsInstall => match family.ok_or_else(unsupported)? {
            DistroFamily::Debian => COMPONENTS_DEBIAN.to_string(),
            DistroFamily::RedHat => COMPONENTS_REDHAT.to_string(),
        },
        StepName::PrimaryInit => PRIMARY_INIT.to_string(),
        StepName::SecondaryJoin => SECONDARY_JOIN.to_string(),
        StepName::ClusterVerification => CLUSTER_VERIFICATION.to_string(),
    };

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_cover_common_distributions() {
        assert_eq!(family("ubuntu"), Some(DistroFamily::Debian));
        assert_eq!(family("rocky"), Some(DistroFamily::RedHat));
        assert_eq!(family("arch"), None);
    }

    #[test]
    fn distro_specific_steps_fail_for_unknown_distro() {
        let err = script(StepName::ComponentsInstall, "arch").unwrap_err();
        assert_eq!(err.code.as_str(), "script.unsupported_distribution");
    }

    #[test]
    fn shared_steps_have_a_default_for_any_distro() {
        assert!(script(StepName::IpForwardConfiguration, "arch").is_ok());
        assert!(script(StepName::ClusterVerification, "arch").is_ok());
    }

    #[test]
    fn system_preparation_reasserts_ip_forward() {
        let text = script(StepName::SystemPreparation, "ubuntu").unwrap();
        assert!(text.contains("net.ipv4.ip_forward"));
        assert!(text.contains("ufw"));
        assert!(script(StepName::SystemPreparation, "centos")
            .unwrap()
            .contains("setenforce"));
    }

    #[test]
    fn runtime_configure_keeps_sandbox_rewrite_and_restarts() {
        let text = script(StepName::ContainerRuntimeConfigure, "ubuntu").unwrap();
        assert!(text.contains(r##"sandbox_image = "{{image_repository}}/pause:3.9"#"##));
        assert!(text.ends_with("systemctl restart containerd"));
        assert!(crate::script::integrity_gaps(&text).is_empty());
    }
}
