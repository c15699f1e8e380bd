use crate::error::{EnvVarSnafu, KubeconfigNotFoundSnafu, KubeconfigSnafu, Result};
use snafu::{OptionExt, ResultExt};
use std::{
    env,
    path::{Path, PathBuf},
};

/// Get the `kube::Config` from the given kubeconfig file, or the default.
/// The default is the file pointed at by `KUBECONFIG`, otherwise the one in the user's home.
pub async fn config_from_kubeconfig(kube_config_path: Option<PathBuf>) -> Result<kube::Config> {
    let file = match kube_config_path {
        Some(config_path) => config_path,
        None => default_kubeconfig()?.context(KubeconfigNotFoundSnafu)?,
    };

    // NOTE: Kubeconfig file may hold multiple contexts to communicate
    //       with different kubernetes clusters. We have to pick master
    //       address of current-context config only
    let kube_config = kube::config::Kubeconfig::read_from(&file).context(KubeconfigSnafu)?;
    let config = kube::Config::from_custom_kubeconfig(kube_config, &Default::default())
        .await
        .context(KubeconfigSnafu)?;
    tracing::debug!(file = %file.display(), cluster_url = %config.cluster_url, "Loaded kubeconfig");
    Ok(config)
}

fn default_kubeconfig() -> Result<Option<PathBuf>> {
    if let Ok(value) = env::var("KUBECONFIG") {
        return Ok(Some(PathBuf::from(value)));
    }

    // Look for kubeconfig file in default location.
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let home = "HOME";
    #[cfg(target_os = "windows")]
    let home = "USERPROFILE";
    let home = env::var(home).context(EnvVarSnafu { name: home })?;

    let default_path = Path::new(&home).join(".kube").join("config");
    Ok(match default_path.exists() {
        true => Some(default_path),
        false => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn missing_kubeconfig_file() {
        let path = PathBuf::from("/this/kubeconfig/does/not/exist");
        let error = config_from_kubeconfig(Some(path)).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);
    }
}
