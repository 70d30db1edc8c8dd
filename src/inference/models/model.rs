#[derive(Debug, Clone)]
pub struct ModelBase {
    /// The name of the model
    pub name: String,

    /// The license of the model
    pub license: String,

    /// The id of the model repository
    pub repo_id: String,

    /// The revision of the model repository
    pub repo_revision: String,
}
