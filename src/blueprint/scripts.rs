// Copyright (c) 2025 - Cowboy AI, Inc.
//! Provisioning scripts rendered from the templates under `templates/`
//!
//! Every interpolated value is a [`ShellWord`], so it reaches the shell as
//! one quoted word whatever it contains. Rendering is a single pass: a value
//! that looks like a placeholder is printed as-is.

use askama::Template;

use crate::cluster::identity::ClusterIdentity;
use crate::errors::ProvisioningResult;
use crate::remote::ShellWord;

/// Account, SSH key and firewall setup shared by every flavor
#[derive(Template)]
#[template(path = "system_requirements.sh", escape = "none")]
pub(crate) struct RequirementsScript {
    cluster: ShellWord,
    admin_password: ShellWord,
    public_key: ShellWord,
    cidr: ShellWord,
    swarm_ports: bool,
}

impl RequirementsScript {
    pub(crate) fn for_cluster(identity: &ClusterIdentity) -> Self {
        Self {
            cluster: ShellWord::new(identity.name()),
            admin_password: ShellWord::new(identity.admin_password()),
            public_key: ShellWord::new(identity.keypair().public_key.clone()),
            cidr: ShellWord::new(identity.cidr().to_string()),
            swarm_ports: false,
        }
    }

    /// Also open the swarm control and overlay ports
    pub(crate) fn with_swarm_ports(mut self) -> Self {
        self.swarm_ports = true;
        self
    }
}

/// Per-role installation script of a swarm node
#[derive(Template)]
#[template(path = "swarm_node.sh", escape = "none")]
pub(crate) struct SwarmNodeScript {
    cluster: ShellWord,
    role: &'static str,
}

impl SwarmNodeScript {
    pub(crate) fn manager(identity: &ClusterIdentity) -> Self {
        Self {
            cluster: ShellWord::new(identity.name()),
            role: "manager",
        }
    }

    pub(crate) fn worker(identity: &ClusterIdentity) -> Self {
        Self {
            cluster: ShellWord::new(identity.name()),
            role: "worker",
        }
    }
}

pub(crate) fn render(script: &impl Template) -> ProvisioningResult<String> {
    Ok(script.render()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::Flavor;
    use crate::cluster::identity::{Complexity, KeyPair};

    fn identity(password: &str) -> ClusterIdentity {
        ClusterIdentity::new(
            "alpha",
            Flavor::Swarm,
            Complexity::Small,
            "10.1.0.0/16".parse().unwrap(),
            password,
            KeyPair {
                name: "alpha".to_string(),
                public_key: "ssh-ed25519 AAAAkey".to_string(),
                private_key: String::new(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_requirements_quote_every_value() {
        let script = render(&RequirementsScript::for_cluster(&identity("s3cret"))).unwrap();

        assert!(script.contains("readonly CLUSTER='alpha'"));
        assert!(script.contains("printf 'cladm:%s\\n' 's3cret' | chpasswd"));
        assert!(script.contains("printf '%s\\n' 'ssh-ed25519 AAAAkey' >"));
        assert!(script.contains("ufw allow from '10.1.0.0/16'"));
        assert!(!script.contains("2377/tcp"));
    }

    #[test]
    fn test_hostile_password_stays_one_word() {
        let password = r#"x"; touch /pwned; echo "{{cidr}}'"#;
        let renders: Vec<String> = (0..20)
            .map(|_| render(&RequirementsScript::for_cluster(&identity(password))).unwrap())
            .collect();

        assert!(renders.windows(2).all(|pair| pair[0] == pair[1]));
        let line = renders[0]
            .lines()
            .find(|line| line.contains("chpasswd"))
            .unwrap();
        assert_eq!(
            line,
            r#"printf 'cladm:%s\n' 'x"; touch /pwned; echo "{{cidr}}'\''' | chpasswd"#
        );
    }

    #[test]
    fn test_swarm_ports_opened_inside_firewall_block() {
        let script = render(&RequirementsScript::for_cluster(&identity("s3cret")).with_swarm_ports())
            .unwrap();
        let firewall: Vec<&str> = script
            .lines()
            .skip_while(|line| !line.starts_with("if command -v ufw"))
            .collect();

        assert_eq!(firewall.len(), 7);
        assert_eq!(firewall[2].trim(), "ufw allow 2377/tcp");
        assert_eq!(firewall[6], "fi");
    }

    #[test]
    fn test_swarm_node_scripts() {
        let manager = render(&SwarmNodeScript::manager(&identity("s3cret"))).unwrap();
        let worker = render(&SwarmNodeScript::worker(&identity("s3cret"))).unwrap();

        assert!(manager.contains("swarm manager for ${CLUSTER}"));
        assert!(worker.contains("swarm worker for ${CLUSTER}"));
        assert!(worker.contains("systemctl enable --now docker"));
    }
}
